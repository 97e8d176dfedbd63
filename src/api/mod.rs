//! HTTP/WebSocket API surface.
//!
//! Thin layer over the intake, orchestrator and status modules: handlers
//! validate and translate, the modules do the work. Ledger access from
//! async handlers goes through `spawn_blocking`.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;
pub mod websocket;

pub use error::ApiError;
pub use router::api_router;
pub use types::ApiContext;
