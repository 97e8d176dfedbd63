pub mod delivery;
pub mod fingerprint;
pub mod job;
pub mod webhook;

pub use delivery::*;
pub use fingerprint::*;
pub use job::*;
pub use webhook::*;
