//! Scripted collaborators for exercising [`CallSessionOrchestrator`] without a
//! host call UI, a telephony account, or real audio hardware.
//!
//! ```rust,ignore
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let signaling = Arc::new(
//!     RecordingSignaling::new()
//!         .with_delay(Duration::from_millis(50))
//!         .emitting(events_tx, &[SignalingEventKind::Started]),
//! );
//! let telephony = Arc::new(ScriptedTelephony::new(ServiceScript::succeed("CA1")));
//! let orchestrator = CallSessionOrchestrator::builder()
//!     .signaling(signaling.clone())
//!     .telephony(telephony.clone())
//!     .build()?;
//! tokio::spawn(orchestrator.clone().serve(events_rx));
//! orchestrator.start_outgoing_call("+14155551234")?;
//! ```
//!
//! [`CallSessionOrchestrator`]: super::CallSessionOrchestrator

use super::{audio::AudioDevice, timer::Timer};
use crate::error::{ServiceError, SignalingError};
use crate::signaling::{SignalingEvent, SignalingEventKind, SignalingEventSender, SignalingGateway};
use crate::telephony::{CreateCallRequest, RemoteCall, TelephonyServiceClient};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Audio device that only counts calls.
#[derive(Debug, Default)]
pub struct CountingAudioDevice {
    acquired: AtomicU64,
    released: AtomicU64,
    fail: bool,
}

impl CountingAudioDevice {
    /// A device whose acquisition always fails (e.g. another app owns it).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

impl AudioDevice for CountingAudioDevice {
    fn acquire(&self) -> Result<()> {
        if self.fail {
            return Err(anyhow!("audio device busy"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Signaling gateway that records every request and answers after a delay.
pub struct RecordingSignaling {
    delay: Duration,
    reject: Option<String>,
    events: Option<(SignalingEventSender, Vec<SignalingEventKind>)>,
    registered: Mutex<Vec<String>>,
    ended: Mutex<Vec<String>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            reject: None,
            events: None,
            registered: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Refuse every registration, as when another call owns the hardware.
    pub fn rejecting(mut self, reason: &str) -> Self {
        self.reject = Some(reason.to_string());
        self
    }

    /// After acknowledging a registration, report `kinds` for that session.
    pub fn emitting(mut self, sender: SignalingEventSender, kinds: &[SignalingEventKind]) -> Self {
        self.events = Some((sender, kinds.to_vec()));
        self
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn end_count(&self) -> usize {
        self.ended().len()
    }

    async fn answer(&self, session_id: &str) -> Result<(), SignalingError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.reject {
            return Err(SignalingError(reason.clone()));
        }
        if let Ok(mut registered) = self.registered.lock() {
            registered.push(session_id.to_string());
        }
        if let Some((sender, kinds)) = &self.events {
            for kind in kinds {
                sender.send(SignalingEvent::new(session_id, *kind)).ok();
            }
        }
        Ok(())
    }
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingGateway for RecordingSignaling {
    async fn register_outgoing(
        &self,
        session_id: &str,
        _handle: &str,
    ) -> Result<(), SignalingError> {
        self.answer(session_id).await
    }

    async fn report_incoming(&self, session_id: &str, _handle: &str) -> Result<(), SignalingError> {
        self.answer(session_id).await
    }

    fn end(&self, session_id: &str) {
        if let Ok(mut ended) = self.ended.lock() {
            ended.push(session_id.to_string());
        }
    }
}

/// How [`ScriptedTelephony`] answers `create_call`.
#[derive(Debug, Clone)]
pub enum ServiceScript {
    Succeed { sid: String, after: Duration },
    Fail { error: ServiceError, after: Duration },
    /// Never answers.
    Hang,
}

impl ServiceScript {
    pub fn succeed(sid: &str) -> Self {
        ServiceScript::Succeed {
            sid: sid.to_string(),
            after: Duration::ZERO,
        }
    }

    pub fn fail(error: ServiceError) -> Self {
        ServiceScript::Fail {
            error,
            after: Duration::ZERO,
        }
    }
}

pub struct ScriptedTelephony {
    script: ServiceScript,
    requests: Mutex<Vec<CreateCallRequest>>,
    hangups: Mutex<Vec<String>>,
}

impl ScriptedTelephony {
    pub fn new(script: ServiceScript) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CreateCallRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.hangups.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TelephonyServiceClient for ScriptedTelephony {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<RemoteCall, ServiceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match &self.script {
            ServiceScript::Succeed { sid, after } => {
                tokio::time::sleep(*after).await;
                Ok(RemoteCall {
                    sid: sid.clone(),
                    status: "queued".to_string(),
                })
            }
            ServiceScript::Fail { error, after } => {
                tokio::time::sleep(*after).await;
                Err(error.clone())
            }
            ServiceScript::Hang => futures::future::pending().await,
        }
    }

    async fn hangup_call(&self, remote_call_id: &str) -> Result<(), ServiceError> {
        if let Ok(mut hangups) = self.hangups.lock() {
            hangups.push(remote_call_id.to_string());
        }
        Ok(())
    }
}

/// Timer whose sleeps only finish when [`fire`](Self::fire) is called.
#[derive(Default)]
pub struct ManualTimer {
    pending: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    /// Complete every outstanding sleep.
    pub fn fire(&self) {
        let waiters = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        for waiter in waiters {
            waiter.send(()).ok();
        }
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(tx);
        }
        Box::pin(async move {
            if rx.await.is_err() {
                // Timer dropped without firing; never wake.
                futures::future::pending::<()>().await;
            }
        })
    }
}
