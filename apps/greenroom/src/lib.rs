pub mod call;
pub mod media;
pub mod negotiation;
pub mod presence;
pub mod relay;
pub mod telemetry;
pub mod transport;
