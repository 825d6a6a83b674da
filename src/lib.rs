pub mod call;
pub mod config;
pub mod error;
pub mod signaling;
pub mod telephony;

pub use call::{CallSessionOrchestrator, CallSessionOrchestratorRef, CallSessionSnapshot, CallState};
pub use error::{CallError, ServiceError, SignalingError};
