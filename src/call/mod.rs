use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

pub mod audio;
pub mod orchestrator;
pub mod session;
pub mod testing;
pub mod timer;

pub use audio::{AudioDevice, AudioSessionController, NullAudioDevice};
pub use orchestrator::{CallSessionOrchestrator, CallSessionOrchestratorRef, OrchestratorBuilder};
pub use session::{CallDirection, CallSession, CallSessionSnapshot, CallState};
pub use timer::{Timer, TokioTimer};

#[cfg(test)]
mod tests;

/// Notifications published by the orchestrator as the session evolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        session_id: String,
        generation: u64,
        state: CallState,
    },
    AudioAcquired {
        session_id: String,
    },
    AudioReleased {
        session_id: String,
    },
}

pub type CallEventSender = broadcast::Sender<CallEvent>;
pub type CallEventReceiver = broadcast::Receiver<CallEvent>;
pub type SessionStateReceiver = watch::Receiver<Option<CallSessionSnapshot>>;
