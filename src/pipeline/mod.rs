pub mod collaborators;
pub mod fingerprint;
pub mod intake;
pub mod orchestrator;
