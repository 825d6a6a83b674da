use crate::call::{
    testing::{CountingAudioDevice, ManualTimer, RecordingSignaling, ScriptedTelephony, ServiceScript},
    CallDirection, CallEvent, CallSessionOrchestrator, CallSessionOrchestratorRef,
    CallSessionSnapshot, CallState, OrchestratorBuilder,
};
use crate::error::{CallError, ServiceError, SignalingError};
use crate::signaling::{SignalingEvent, SignalingEventKind};
use crate::telephony::MockTelephonyServiceClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Orchestrator whose collaborators never answer on their own, so tests can
/// deliver every callback by hand.
struct Harness {
    orchestrator: CallSessionOrchestratorRef,
    signaling: Arc<RecordingSignaling>,
    telephony: Arc<ScriptedTelephony>,
    audio: Arc<CountingAudioDevice>,
    timer: Arc<ManualTimer>,
}

fn quiet_harness() -> Harness {
    let signaling = Arc::new(RecordingSignaling::new().with_delay(Duration::from_secs(3600)));
    let telephony = Arc::new(ScriptedTelephony::new(ServiceScript::Hang));
    let audio = Arc::new(CountingAudioDevice::default());
    let timer = Arc::new(ManualTimer::new());
    let orchestrator = CallSessionOrchestrator::builder()
        .from_number("+14155550000")
        .callback_url("https://example.com/twiml")
        .signaling(signaling.clone())
        .telephony(telephony.clone())
        .audio_device(audio.clone())
        .timer(timer.clone())
        .build()
        .unwrap();
    Harness {
        orchestrator,
        signaling,
        telephony,
        audio,
        timer,
    }
}

async fn wait_for_state(
    orchestrator: &CallSessionOrchestratorRef,
    state: CallState,
) -> CallSessionSnapshot {
    let mut rx = orchestrator.subscribe();
    let snapshot = timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| s.as_ref().is_some_and(|s| s.state == state)),
    )
    .await
    .expect("state not reached in time")
    .expect("orchestrator dropped")
    .clone();
    snapshot.unwrap()
}

async fn wait_for_hangup(telephony: &ScriptedTelephony) {
    timeout(Duration::from_secs(2), async {
        while telephony.hangups().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("remote call not hung up");
}

#[tokio::test]
async fn test_second_start_is_rejected_without_touching_first() {
    let h = quiet_harness();
    let first = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    assert_eq!(first.state, CallState::Requesting);
    assert_eq!(first.direction, CallDirection::Outbound);

    assert_eq!(
        h.orchestrator.start_outgoing_call("+14155559999"),
        Err(CallError::SessionAlreadyActive)
    );
    assert_eq!(
        h.orchestrator.report_incoming_call("+14155559999"),
        Err(CallError::SessionAlreadyActive)
    );
    assert_eq!(h.orchestrator.snapshot(), Some(first));
}

#[tokio::test]
async fn test_confirmations_connect_in_either_order() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator.on_service_call_created(g, "CA1".to_string());
    assert_eq!(h.orchestrator.state(), CallState::ServiceConfirmed);
    h.orchestrator.on_signaling_started(g);
    assert_eq!(h.orchestrator.state(), CallState::Connected);

    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator.on_signaling_started(g);
    assert_eq!(h.orchestrator.state(), CallState::SignalingConfirmed);
    h.orchestrator.on_service_call_created(g, "CA1".to_string());

    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.remote_call_id.as_deref(), Some("CA1"));
    assert!(snapshot.connected_at.is_some());
    assert!(snapshot.generation > g);
}

#[tokio::test]
async fn test_service_failure_after_signaling_rolls_back() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator.on_signaling_registered(g, Ok(()));
    h.orchestrator.on_signaling_started(g);
    h.orchestrator
        .on_service_call_failed(g, ServiceError::ServerError(503));

    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(
        snapshot.failure_reason(),
        Some(&CallError::ServiceServerError(503))
    );
    assert_eq!(h.signaling.ended(), vec![session.id.clone()]);

    // The rollback already bumped the generation; repeats are stale.
    h.orchestrator
        .on_service_call_failed(g, ServiceError::ServerError(503));
    h.orchestrator.on_service_timeout(g);
    assert_eq!(h.signaling.end_count(), 1);
}

#[tokio::test]
async fn test_signaling_rejection_fails_without_end() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator
        .on_signaling_registered(g, Err(SignalingError("call in progress".to_string())));
    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(
        snapshot.failure_reason(),
        Some(&CallError::SignalingRejected("call in progress".to_string()))
    );

    // Late service answer for the abandoned request.
    h.orchestrator.on_service_call_created(g, "CA1".to_string());
    let after = h.orchestrator.snapshot().unwrap();
    assert_eq!(after, snapshot);
    assert_eq!(after.remote_call_id, None);
    assert_eq!(h.signaling.end_count(), 0);
}

#[tokio::test]
async fn test_signaling_rejection_after_service_hangs_up_remote() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator.on_service_call_created(g, "CA1".to_string());
    h.orchestrator
        .on_signaling_registered(g, Err(SignalingError("busy".to_string())));

    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(snapshot.remote_call_id.as_deref(), Some("CA1"));
    wait_for_hangup(&h.telephony).await;
    assert_eq!(h.telephony.hangups(), vec!["CA1".to_string()]);
    assert_eq!(h.signaling.end_count(), 0);
}

#[tokio::test]
async fn test_service_failure_after_confirmation_is_ignored() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator.on_service_call_created(g, "CA1".to_string());
    h.orchestrator
        .on_service_call_failed(g, ServiceError::ServerError(500));

    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::ServiceConfirmed);
    assert_eq!(snapshot.reason, None);
    assert_eq!(h.signaling.end_count(), 0);

    h.orchestrator.on_signaling_started(g);
    assert_eq!(h.orchestrator.state(), CallState::Connected);
}

#[tokio::test]
async fn test_service_outcomes_ignored_for_inbound_call() {
    let h = quiet_harness();
    let session = h.orchestrator.report_incoming_call("+14155551234").unwrap();
    let g = session.generation;

    h.orchestrator
        .on_service_call_failed(g, ServiceError::RateLimited);
    h.orchestrator.on_service_call_created(g, "CA9".to_string());
    h.orchestrator.on_service_timeout(g);

    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot, session);
    assert_eq!(snapshot.remote_call_id, None);
    assert_eq!(h.signaling.end_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_pending_hangup() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;
    h.orchestrator.on_signaling_started(g);
    h.orchestrator.on_service_call_created(g, "CA5".to_string());

    assert!(h.orchestrator.end_call());
    h.orchestrator.shutdown();
    assert!(h.orchestrator.drain(Duration::from_secs(2)).await);
    assert_eq!(h.telephony.hangups(), vec!["CA5".to_string()]);

    // Nothing left to wait for.
    assert!(h.orchestrator.drain(Duration::from_millis(10)).await);
}

#[tokio::test]
async fn test_stale_generation_from_previous_session_is_ignored() {
    let h = quiet_harness();
    let old = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    h.orchestrator.end_call();

    let current = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    assert!(current.generation > old.generation);
    assert_ne!(current.id, old.id);

    h.orchestrator.on_signaling_started(old.generation);
    h.orchestrator
        .on_service_call_created(old.generation, "CA-old".to_string());
    h.orchestrator
        .on_service_call_failed(old.generation, ServiceError::AuthFailure);

    assert_eq!(h.orchestrator.snapshot(), Some(current));
}

#[tokio::test]
async fn test_signaling_events_for_unknown_session_are_dropped() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();

    h.orchestrator
        .dispatch_signaling(SignalingEvent::new("someone-else", SignalingEventKind::Ended));
    assert_eq!(h.orchestrator.snapshot(), Some(session.clone()));

    h.orchestrator
        .dispatch_signaling(SignalingEvent::new(session.id.clone(), SignalingEventKind::Started));
    assert_eq!(h.orchestrator.state(), CallState::SignalingConfirmed);
}

#[tokio::test]
async fn test_timeout_rolls_back_pending_service_call() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    h.orchestrator.on_signaling_started(session.generation);

    // Let the timer task register its sleep.
    tokio::task::yield_now().await;
    timeout(Duration::from_secs(2), async {
        while h.timer.pending() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    h.timer.fire();

    let snapshot = wait_for_state(&h.orchestrator, CallState::Failed).await;
    assert_eq!(snapshot.failure_reason(), Some(&CallError::ServiceTimeout));
    assert_eq!(h.signaling.end_count(), 1);
}

#[tokio::test]
async fn test_timeout_after_service_confirmation_is_ignored() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    h.orchestrator
        .on_service_call_created(session.generation, "CA1".to_string());

    h.orchestrator.on_service_timeout(session.generation);
    assert_eq!(h.orchestrator.state(), CallState::ServiceConfirmed);
}

#[tokio::test]
async fn test_end_call_notifies_host_and_service() {
    let h = quiet_harness();
    let mut events = h.orchestrator.events();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;
    h.orchestrator.on_signaling_started(g);
    h.orchestrator.on_service_call_created(g, "CA7".to_string());
    let connected = h.orchestrator.snapshot().unwrap();
    h.orchestrator.on_audio_activated(connected.generation);
    assert_eq!(h.audio.acquired(), 1);

    assert!(h.orchestrator.end_call());
    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Ended);
    assert_eq!(snapshot.reason, Some(CallError::UserCancelled));
    assert_eq!(snapshot.failure_reason(), None);
    assert!(snapshot.ended_at.is_some());
    assert_eq!(h.signaling.ended(), vec![session.id.clone()]);
    assert_eq!(h.audio.released(), 1);
    assert_eq!(h.orchestrator.audio_balance(), (1, 1));

    wait_for_hangup(&h.telephony).await;
    assert_eq!(h.telephony.hangups(), vec!["CA7".to_string()]);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            CallState::Requesting,
            CallState::SignalingConfirmed,
            CallState::Connected,
            CallState::Ending,
            CallState::Ended,
        ]
    );

    assert!(!h.orchestrator.end_call());
}

#[tokio::test]
async fn test_host_ended_call_has_no_failure() {
    let h = quiet_harness();
    let session = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    let g = session.generation;
    h.orchestrator.on_signaling_started(g);
    h.orchestrator.on_service_call_created(g, "CA1".to_string());
    let connected = h.orchestrator.snapshot().unwrap();

    h.orchestrator.on_signaling_ended(connected.generation);
    let snapshot = h.orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::Ended);
    assert_eq!(snapshot.reason, None);
    assert_eq!(h.signaling.end_count(), 0);
}

#[tokio::test]
async fn test_inbound_call_connects_on_answer() {
    let h = quiet_harness();
    let session = h.orchestrator.report_incoming_call("+14155551234").unwrap();
    assert_eq!(session.direction, CallDirection::Inbound);

    // Audio may be activated by the host before the call is answered.
    h.orchestrator.on_audio_activated(session.generation);
    assert_eq!(h.audio.acquired(), 0);

    h.orchestrator.on_signaling_answered(session.generation);
    assert_eq!(h.orchestrator.state(), CallState::Connected);
    assert_eq!(h.audio.acquired(), 1);
    assert!(h.telephony.requests().is_empty());

    h.orchestrator.end_call();
    assert_eq!(h.audio.released(), 1);
}

#[tokio::test]
async fn test_audio_deactivation_keeps_balance() {
    let h = quiet_harness();
    let session = h.orchestrator.report_incoming_call("+14155551234").unwrap();
    h.orchestrator.on_signaling_answered(session.generation);
    let connected = h.orchestrator.snapshot().unwrap();

    h.orchestrator.on_audio_activated(connected.generation);
    h.orchestrator.on_audio_deactivated(connected.generation);
    h.orchestrator.on_signaling_ended(connected.generation);

    assert_eq!(h.audio.acquired(), 1);
    assert_eq!(h.audio.released(), 1);
}

#[tokio::test]
async fn test_acknowledge_returns_to_idle_and_terminal_is_superseded() {
    let h = quiet_harness();
    assert_eq!(h.orchestrator.state(), CallState::Idle);
    assert!(!h.orchestrator.acknowledge());

    let first = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    assert!(!h.orchestrator.acknowledge());
    h.orchestrator.end_call();
    assert!(h.orchestrator.acknowledge());
    assert_eq!(h.orchestrator.state(), CallState::Idle);
    assert_eq!(*h.orchestrator.subscribe().borrow(), None);

    let second = h.orchestrator.start_outgoing_call("+14155551234").unwrap();
    h.orchestrator
        .on_service_call_failed(second.generation, ServiceError::RateLimited);
    assert_eq!(h.orchestrator.state(), CallState::Failed);

    let third = h.orchestrator.report_incoming_call("+14155551234").unwrap();
    assert_eq!(third.state, CallState::Requesting);
    assert!(third.generation > second.generation);
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn test_create_call_request_uses_configured_identity() {
    let telephony = Arc::new(ScriptedTelephony::new(ServiceScript::Hang));
    let orchestrator = CallSessionOrchestrator::builder()
        .from_number("+14155550000")
        .callback_url("https://example.com/twiml")
        .signaling(Arc::new(RecordingSignaling::new()))
        .telephony(telephony.clone())
        .timer(Arc::new(ManualTimer::new()))
        .build()
        .unwrap();
    orchestrator.start_outgoing_call("+14155551234").unwrap();

    timeout(Duration::from_secs(2), async {
        while telephony.requests().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let request = &telephony.requests()[0];
    assert_eq!(request.from, "+14155550000");
    assert_eq!(request.to, "+14155551234");
    assert_eq!(request.callback_url, "https://example.com/twiml");
}

#[tokio::test]
async fn test_auth_failure_from_mocked_service() {
    let mut telephony = MockTelephonyServiceClient::new();
    telephony
        .expect_create_call()
        .times(1)
        .returning(|_| Err(ServiceError::AuthFailure));
    telephony.expect_hangup_call().never();

    let signaling = Arc::new(RecordingSignaling::new());
    let audio = Arc::new(CountingAudioDevice::default());
    let orchestrator = CallSessionOrchestrator::builder()
        .signaling(signaling.clone())
        .telephony(Arc::new(telephony))
        .audio_device(audio.clone())
        .timer(Arc::new(ManualTimer::new()))
        .build()
        .unwrap();
    orchestrator.start_outgoing_call("+14155551234").unwrap();

    let snapshot = wait_for_state(&orchestrator, CallState::Failed).await;
    assert_eq!(snapshot.failure_reason(), Some(&CallError::ServiceAuthFailure));
    assert!(snapshot
        .failure_reason()
        .is_some_and(|reason| reason.requires_credentials()));
    assert_eq!(signaling.end_count(), 1);
    assert_eq!(audio.acquired(), 0);
}

#[tokio::test]
async fn test_default_builder_clamps_service_timeout() {
    let orchestrator = OrchestratorBuilder::default()
        .service_timeout(Duration::MAX)
        .signaling(Arc::new(RecordingSignaling::new()))
        .telephony(Arc::new(ScriptedTelephony::new(ServiceScript::Hang)))
        .build()
        .unwrap();
    assert_eq!(orchestrator.state(), CallState::Idle);
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    assert!(CallSessionOrchestrator::builder().build().is_err());
    assert!(CallSessionOrchestrator::builder()
        .signaling(Arc::new(RecordingSignaling::new()))
        .build()
        .is_err());
}
