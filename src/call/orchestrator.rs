use super::{
    audio::{AudioDevice, AudioSessionController, NullAudioDevice},
    session::{CallDirection, CallSession, CallSessionSnapshot, CallState, Registration},
    timer::{Timer, TokioTimer},
    CallEvent, CallEventReceiver, CallEventSender, SessionStateReceiver,
};
use crate::{
    config::OrchestratorConfig,
    error::{CallError, ServiceError, SignalingError},
    signaling::{SignalingEvent, SignalingEventKind, SignalingEventReceiver, SignalingGateway},
    telephony::{CreateCallRequest, TelephonyServiceClient},
};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::{select, sync::broadcast, sync::watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

pub type CallSessionOrchestratorRef = Arc<CallSessionOrchestrator>;

struct SessionCore {
    session: Option<CallSession>,
    last_generation: u64,
    audio: AudioSessionController,
    /// Cancels every request and timer issued for the current session.
    epoch: CancellationToken,
    service_timer: Option<CancellationToken>,
}

impl SessionCore {
    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_terminal())
    }

    fn cancel_epoch(&mut self) {
        self.epoch.cancel();
        self.service_timer = None;
    }
}

/// Owns the single call session and keeps it consistent with the host call UI
/// and the telephony service.
///
/// Every mutation happens under one lock, whichever task the triggering
/// callback arrived on. Callbacks carry the generation they were issued for
/// and are dropped if the session has moved on.
pub struct CallSessionOrchestrator {
    config: OrchestratorConfig,
    from_number: String,
    callback_url: String,
    core: Mutex<SessionCore>,
    signaling: Arc<dyn SignalingGateway>,
    telephony: Arc<dyn TelephonyServiceClient>,
    timer: Arc<dyn Timer>,
    state_tx: watch::Sender<Option<CallSessionSnapshot>>,
    event_tx: CallEventSender,
    cancel_token: CancellationToken,
    /// Remote hangups still in flight; drained on shutdown.
    hangups: TaskTracker,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    from_number: Option<String>,
    callback_url: Option<String>,
    signaling: Option<Arc<dyn SignalingGateway>>,
    telephony: Option<Arc<dyn TelephonyServiceClient>>,
    audio_device: Option<Arc<dyn AudioDevice>>,
    timer: Option<Arc<dyn Timer>>,
    cancel_token: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            from_number: None,
            callback_url: None,
            signaling: None,
            telephony: None,
            audio_device: None,
            timer: None,
            cancel_token: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service_timeout(mut self, timeout: Duration) -> Self {
        self.config.service_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn from_number(mut self, number: impl Into<String>) -> Self {
        self.from_number = Some(number.into());
        self
    }

    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn signaling(mut self, signaling: Arc<dyn SignalingGateway>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn telephony(mut self, telephony: Arc<dyn TelephonyServiceClient>) -> Self {
        self.telephony = Some(telephony);
        self
    }

    pub fn audio_device(mut self, device: Arc<dyn AudioDevice>) -> Self {
        self.audio_device = Some(device);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Result<CallSessionOrchestratorRef> {
        let signaling = self
            .signaling
            .ok_or_else(|| anyhow!("orchestrator: signaling gateway is required"))?;
        let telephony = self
            .telephony
            .ok_or_else(|| anyhow!("orchestrator: telephony client is required"))?;
        let audio_device = self
            .audio_device
            .unwrap_or_else(|| Arc::new(NullAudioDevice));
        let (state_tx, _) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(64);

        Ok(Arc::new(CallSessionOrchestrator {
            config: self.config,
            from_number: self.from_number.unwrap_or_default(),
            callback_url: self.callback_url.unwrap_or_default(),
            core: Mutex::new(SessionCore {
                session: None,
                last_generation: 0,
                audio: AudioSessionController::new(audio_device),
                epoch: CancellationToken::new(),
                service_timer: None,
            }),
            signaling,
            telephony,
            timer: self.timer.unwrap_or_else(|| Arc::new(TokioTimer)),
            state_tx,
            event_tx,
            cancel_token: self.cancel_token.unwrap_or_default(),
            hangups: TaskTracker::new(),
        }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSessionOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Place an outgoing call. Returns as soon as both collaborators have been
    /// asked; progress is observed through [`subscribe`](Self::subscribe).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_outgoing_call(
        self: &Arc<Self>,
        number: &str,
    ) -> Result<CallSessionSnapshot, CallError> {
        let mut core = self.core();
        let (snapshot, epoch) = self.create_session(&mut core, CallDirection::Outbound, number)?;
        let session_id = snapshot.id.clone();
        let generation = snapshot.generation;

        let this = self.clone();
        let signaling_epoch = epoch.clone();
        let handle = number.to_string();
        let sid = session_id.clone();
        tokio::spawn(async move {
            select! {
                _ = signaling_epoch.cancelled() => {
                    debug!(session_id = sid, generation, "outgoing registration abandoned");
                }
                result = this.signaling.register_outgoing(&sid, &handle) => {
                    this.on_signaling_registered(generation, result);
                }
            }
        });

        let request = CreateCallRequest {
            from: self.from_number.clone(),
            to: number.to_string(),
            callback_url: self.callback_url.clone(),
        };
        let this = self.clone();
        let service_epoch = epoch.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            select! {
                _ = service_epoch.cancelled() => {
                    debug!(session_id = sid, generation, "service call request cancelled");
                }
                result = this.telephony.create_call(&request) => match result {
                    Ok(call) => this.on_service_call_created(generation, call.sid),
                    Err(e) => this.on_service_call_failed(generation, e),
                }
            }
        });

        let timer_token = epoch.child_token();
        core.service_timer = Some(timer_token.clone());
        let this = self.clone();
        let wait = self.timer.sleep(self.config.service_timeout());
        tokio::spawn(async move {
            select! {
                _ = timer_token.cancelled() => {}
                _ = wait => this.on_service_timeout(generation),
            }
        });

        Ok(self.publish_snapshot(snapshot))
    }

    /// Present a call initiated by the far end. No service request is issued.
    pub fn report_incoming_call(
        self: &Arc<Self>,
        number: &str,
    ) -> Result<CallSessionSnapshot, CallError> {
        let mut core = self.core();
        let (snapshot, epoch) = self.create_session(&mut core, CallDirection::Inbound, number)?;
        let session_id = snapshot.id.clone();
        let generation = snapshot.generation;

        let this = self.clone();
        let handle = number.to_string();
        tokio::spawn(async move {
            select! {
                _ = epoch.cancelled() => {
                    debug!(session_id, generation, "incoming report abandoned");
                }
                result = this.signaling.report_incoming(&session_id, &handle) => {
                    this.on_signaling_registered(generation, result);
                }
            }
        });

        Ok(self.publish_snapshot(snapshot))
    }

    /// Hang up the current call. Returns false if there was nothing to end.
    pub fn end_call(&self) -> bool {
        let mut core = self.core();
        if !core.is_active() {
            debug!("end_call without an active session");
            return false;
        }
        info!("ending call on user request");
        self.terminate(&mut core, Some(CallError::UserCancelled), true);
        self.publish(&core);
        true
    }

    /// Forget a terminal session so the orchestrator reads as idle again.
    pub fn acknowledge(&self) -> bool {
        let mut core = self.core();
        match core.session.as_ref() {
            Some(session) if session.is_terminal() => {
                debug!(session_id = session.id(), "terminal session acknowledged");
                core.session = None;
                self.state_tx.send_replace(None);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Option<CallSessionSnapshot> {
        self.core().session.as_ref().map(CallSession::snapshot)
    }

    pub fn state(&self) -> CallState {
        self.core()
            .session
            .as_ref()
            .map(CallSession::state)
            .unwrap_or(CallState::Idle)
    }

    /// Latest session snapshot; `None` while idle.
    pub fn subscribe(&self) -> SessionStateReceiver {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> CallEventReceiver {
        self.event_tx.subscribe()
    }

    /// Device acquisitions and releases over the orchestrator's lifetime.
    pub fn audio_balance(&self) -> (u64, u64) {
        let core = self.core();
        (core.audio.acquisitions(), core.audio.releases())
    }

    /// Pump host call UI callbacks into the session until cancelled or the
    /// channel closes.
    pub async fn serve(self: Arc<Self>, mut events: SignalingEventReceiver) -> Result<()> {
        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    info!("orchestrator cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch_signaling(event),
                    None => {
                        info!("signaling channel closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop pumping callbacks and abandon in-flight requests. Remote hangups
    /// already issued keep running; see [`drain`](Self::drain).
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        self.core().cancel_epoch();
        self.hangups.close();
    }

    /// Wait for outstanding remote hangups after [`shutdown`](Self::shutdown).
    /// Returns false if some were still running when `limit` elapsed.
    pub async fn drain(&self, limit: Duration) -> bool {
        if self.hangups.is_empty() {
            return true;
        }
        info!(pending = self.hangups.len(), "waiting for remote hangups");
        match tokio::time::timeout(limit, self.hangups.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.hangups.len(), "remote hangups still pending");
                false
            }
        }
    }

    /// Route a host callback to its handler, tagged with the generation of the
    /// session it names. Unknown sessions are dropped.
    pub fn dispatch_signaling(&self, event: SignalingEvent) {
        let generation = {
            let core = self.core();
            match core.session.as_ref() {
                Some(session) if session.id() == event.session_id => session.generation(),
                _ => {
                    debug!(
                        session_id = event.session_id,
                        kind = ?event.kind,
                        "signaling event for unknown session"
                    );
                    return;
                }
            }
        };
        match event.kind {
            SignalingEventKind::Started => self.on_signaling_started(generation),
            SignalingEventKind::Answered => self.on_signaling_answered(generation),
            SignalingEventKind::Ended => self.on_signaling_ended(generation),
            SignalingEventKind::AudioActivated => self.on_audio_activated(generation),
            SignalingEventKind::AudioDeactivated => self.on_audio_deactivated(generation),
        }
    }

    pub fn on_signaling_registered(&self, generation: u64, result: Result<(), SignalingError>) {
        self.with_current(generation, "signaling_registered", |core| {
            let Some(session) = core.session.as_mut() else {
                return;
            };
            match result {
                Ok(()) => {
                    if session.registration == Registration::Pending {
                        session.registration = Registration::Registered;
                    }
                }
                Err(e) => {
                    warn!(session_id = session.id(), generation, "signaling rejected: {}", e);
                    session.registration = Registration::Rejected;
                    self.fail(core, CallError::from(e));
                }
            }
        });
    }

    pub fn on_signaling_started(&self, generation: u64) {
        self.with_current(generation, "signaling_started", |core| {
            self.confirm_signaling(core);
        });
    }

    pub fn on_signaling_answered(&self, generation: u64) {
        self.with_current(generation, "signaling_answered", |core| {
            self.confirm_signaling(core);
        });
    }

    /// The host ended the call on its own (system UI hangup, interruption).
    pub fn on_signaling_ended(&self, generation: u64) {
        self.with_current(generation, "signaling_ended", |core| {
            info!(generation, "call ended by host");
            self.terminate(core, None, false);
        });
    }

    pub fn on_service_call_created(&self, generation: u64, remote_call_id: String) {
        self.with_current(generation, "service_call_created", |core| {
            let Some(session) = core.session.as_mut() else {
                return;
            };
            if session.direction == CallDirection::Inbound {
                debug!(session_id = session.id(), "no service request for inbound call");
                return;
            }
            if !session.confirm_service(remote_call_id) {
                debug!(session_id = session.id(), "service already settled");
                return;
            }
            info!(
                session_id = session.id(),
                generation,
                remote_call_id = session.remote_call_id.as_deref().unwrap_or_default(),
                "service confirmed call"
            );
            if let Some(timer) = core.service_timer.take() {
                timer.cancel();
            }
            self.try_connect(core);
        });
    }

    pub fn on_service_call_failed(&self, generation: u64, error: ServiceError) {
        self.with_current(generation, "service_call_failed", |core| {
            if !Self::awaiting_service(core) {
                debug!(generation, "service outcome already settled: {}", error);
                return;
            }
            warn!(generation, "service call failed: {}", error);
            self.rollback(core, CallError::from(error));
        });
    }

    pub fn on_service_timeout(&self, generation: u64) {
        self.with_current(generation, "service_timeout", |core| {
            if !Self::awaiting_service(core) {
                return;
            }
            warn!(
                generation,
                timeout = self.config.service_timeout_ms,
                "service call timed out"
            );
            self.rollback(core, CallError::ServiceTimeout);
        });
    }

    pub fn on_audio_activated(&self, generation: u64) {
        self.with_current(generation, "audio_activated", |core| {
            if core.audio.on_activated() {
                self.emit_audio(core, true);
            }
        });
    }

    pub fn on_audio_deactivated(&self, generation: u64) {
        self.with_current(generation, "audio_deactivated", |core| {
            if core.audio.on_deactivated() {
                self.emit_audio(core, false);
            }
        });
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_session(
        &self,
        core: &mut SessionCore,
        direction: CallDirection,
        number: &str,
    ) -> Result<(CallSessionSnapshot, CancellationToken), CallError> {
        if let Some(active) = core.session.as_ref().filter(|s| !s.is_terminal()) {
            warn!(
                session_id = active.id(),
                state = ?active.state(),
                "rejecting new {} call, session already active",
                direction
            );
            return Err(CallError::SessionAlreadyActive);
        }
        core.cancel_epoch();
        core.epoch = CancellationToken::new();

        let generation = core.next_generation();
        let session = CallSession::new(generation, direction, number, self.timer.now());
        let snapshot = session.snapshot();
        info!(session_id = snapshot.id, generation, %direction, number, "call session created");
        core.session = Some(session);
        Ok((snapshot, core.epoch.clone()))
    }

    /// Run `apply` only if `generation` still names the live session.
    fn with_current<F>(&self, generation: u64, callback: &str, apply: F)
    where
        F: FnOnce(&mut SessionCore),
    {
        let mut core = self.core();
        match core.session.as_ref() {
            Some(session) if session.generation() == generation && !session.is_terminal() => {}
            Some(session) => {
                debug!(
                    session_id = session.id(),
                    generation,
                    current = session.generation(),
                    callback,
                    "dropping stale callback"
                );
                return;
            }
            None => {
                debug!(generation, callback, "dropping callback, no session");
                return;
            }
        }
        apply(&mut *core);
        self.publish(&core);
    }

    /// Only one service outcome is accepted per outgoing session.
    fn awaiting_service(core: &SessionCore) -> bool {
        core.session
            .as_ref()
            .is_some_and(|s| s.direction == CallDirection::Outbound && !s.service_confirmed)
    }

    fn confirm_signaling(&self, core: &mut SessionCore) {
        let Some(session) = core.session.as_mut() else {
            return;
        };
        session.confirm_signaling();
        debug!(session_id = session.id(), "signaling confirmed");
        self.try_connect(core);
    }

    fn try_connect(&self, core: &mut SessionCore) {
        let ready = core
            .session
            .as_ref()
            .is_some_and(|s| s.state() != CallState::Connected && s.ready_to_connect());
        if !ready {
            return;
        }
        let generation = core.next_generation();
        if let Some(session) = core.session.as_mut() {
            session.connect(generation, self.timer.now());
            info!(session_id = session.id(), generation, "call connected");
        }
        if let Some(timer) = core.service_timer.take() {
            timer.cancel();
        }
        if core.audio.expect_activation() {
            self.emit_audio(core, true);
        }
    }

    /// Undo a half-established call: the host may already show it, but there
    /// is no audio path behind it.
    fn rollback(&self, core: &mut SessionCore, reason: CallError) {
        if let Some(session) = core.session.as_ref() {
            if session.registration != Registration::Rejected {
                info!(session_id = session.id(), "rolling back host call registration");
                self.signaling.end(session.id());
            }
        }
        self.fail(core, reason);
    }

    fn fail(&self, core: &mut SessionCore, reason: CallError) {
        core.cancel_epoch();
        let generation = core.next_generation();
        let now = self.timer.now();
        if let Some(session) = core.session.as_mut() {
            warn!(session_id = session.id(), generation, reason = %reason, "call failed");
            session.fail(generation, reason, now);
            if let Some(remote_call_id) = session.remote_call_id.clone() {
                self.hangup_remote(session.id().to_string(), remote_call_id);
            }
        }
        self.release_audio(core);
    }

    /// Ending -> Ended. `notify_host` is false when the host itself ended the call.
    fn terminate(&self, core: &mut SessionCore, reason: Option<CallError>, notify_host: bool) {
        core.cancel_epoch();
        let generation = core.next_generation();
        let Some(session) = core.session.as_mut() else {
            return;
        };
        session.begin_ending(generation);
        let session_id = session.id().to_string();
        let registered = session.registration != Registration::Rejected;
        let remote_call_id = session.remote_call_id.clone();
        self.publish(core);

        if notify_host && registered {
            self.signaling.end(&session_id);
        }
        if let Some(remote_call_id) = remote_call_id {
            self.hangup_remote(session_id.clone(), remote_call_id);
        }

        let now = self.timer.now();
        if let Some(session) = core.session.as_mut() {
            session.finish(reason, now);
        }
        info!(session_id, generation, "call ended");
        self.release_audio(core);
    }

    /// Best-effort remote termination. Local state never waits on it.
    fn hangup_remote(&self, session_id: String, remote_call_id: String) {
        let telephony = self.telephony.clone();
        self.hangups.spawn(async move {
            if let Err(e) = telephony.hangup_call(&remote_call_id).await {
                warn!(
                    session_id,
                    remote_call_id, "failed to hang up remote call: {}", e
                );
            }
        });
    }

    fn release_audio(&self, core: &mut SessionCore) {
        if core.audio.release() {
            self.emit_audio(core, false);
        }
    }

    fn emit_audio(&self, core: &SessionCore, acquired: bool) {
        let Some(session) = core.session.as_ref() else {
            return;
        };
        let session_id = session.id().to_string();
        let event = if acquired {
            CallEvent::AudioAcquired { session_id }
        } else {
            CallEvent::AudioReleased { session_id }
        };
        self.event_tx.send(event).ok();
    }

    fn publish(&self, core: &SessionCore) {
        if let Some(session) = core.session.as_ref() {
            self.publish_snapshot(session.snapshot());
        }
    }

    fn publish_snapshot(&self, snapshot: CallSessionSnapshot) -> CallSessionSnapshot {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&snapshot) {
                return false;
            }
            *current = Some(snapshot.clone());
            true
        });
        if changed {
            self.event_tx
                .send(CallEvent::StateChanged {
                    session_id: snapshot.id.clone(),
                    generation: snapshot.generation,
                    state: snapshot.state,
                })
                .ok();
        }
        snapshot
    }
}
