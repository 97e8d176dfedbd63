pub mod enums;
pub mod events;
pub mod fingerprint;
pub mod job;
pub mod webhook;

pub use enums::*;
pub use events::*;
pub use fingerprint::*;
pub use job::*;
pub use webhook::*;
