use super::{SignalingEvent, SignalingEventKind, SignalingEventSender, SignalingGateway};
use crate::error::SignalingError;
use async_trait::async_trait;
use tracing::info;

/// Gateway for hosts without a native call UI.
///
/// Every intent is accepted at once and reported as connected with audio
/// available, so the call state is driven by the telephony service alone.
pub struct HeadlessSignalingGateway {
    events: SignalingEventSender,
}

impl HeadlessSignalingGateway {
    pub fn new(events: SignalingEventSender) -> Self {
        Self { events }
    }

    fn emit(&self, session_id: &str, kinds: &[SignalingEventKind]) {
        for kind in kinds {
            self.events
                .send(SignalingEvent::new(session_id, *kind))
                .ok();
        }
    }
}

#[async_trait]
impl SignalingGateway for HeadlessSignalingGateway {
    async fn register_outgoing(
        &self,
        session_id: &str,
        handle: &str,
    ) -> Result<(), SignalingError> {
        info!(session_id, handle, "headless: outgoing call registered");
        self.emit(
            session_id,
            &[SignalingEventKind::Started, SignalingEventKind::AudioActivated],
        );
        Ok(())
    }

    async fn report_incoming(&self, session_id: &str, handle: &str) -> Result<(), SignalingError> {
        info!(session_id, handle, "headless: incoming call auto-answered");
        self.emit(
            session_id,
            &[SignalingEventKind::Answered, SignalingEventKind::AudioActivated],
        );
        Ok(())
    }

    fn end(&self, session_id: &str) {
        info!(session_id, "headless: call ended");
    }
}
