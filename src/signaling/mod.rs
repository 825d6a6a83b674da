use crate::error::SignalingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod headless;
pub use headless::HeadlessSignalingGateway;

/// Lifecycle notifications delivered by the host call UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingEventKind {
    Started,
    Answered,
    Ended,
    AudioActivated,
    AudioDeactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEvent {
    pub session_id: String,
    pub kind: SignalingEventKind,
}

impl SignalingEvent {
    pub fn new(session_id: impl Into<String>, kind: SignalingEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
        }
    }
}

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;
pub type SignalingEventReceiver = mpsc::UnboundedReceiver<SignalingEvent>;

/// Host-provided integration with the native call UI.
///
/// Implementations report lifecycle changes through a [`SignalingEventSender`]
/// handed to them by the embedding application; the orchestrator consumes the
/// paired receiver in [`CallSessionOrchestrator::serve`](crate::call::CallSessionOrchestrator::serve).
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Register an outgoing call intent. Fails if the host refuses the call.
    async fn register_outgoing(&self, session_id: &str, handle: &str)
        -> Result<(), SignalingError>;

    /// Present an incoming call.
    async fn report_incoming(&self, session_id: &str, handle: &str) -> Result<(), SignalingError>;

    /// Tear down whatever the host shows for this session. Fire-and-forget.
    fn end(&self, session_id: &str);
}
