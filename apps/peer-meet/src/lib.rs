pub mod config;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod telemetry;
