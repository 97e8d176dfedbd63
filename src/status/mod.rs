pub mod broker;
pub mod watcher;

pub use broker::StatusBroker;
