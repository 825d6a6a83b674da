use crate::error::CallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outbound => write!(f, "outbound"),
            CallDirection::Inbound => write!(f, "inbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Requesting,
    SignalingConfirmed,
    ServiceConfirmed,
    Connected,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    /// No further transitions are possible once a session reaches these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

/// Progress of the host-side registration of the call intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Pending,
    Registered,
    Rejected,
}

/// The single call being orchestrated. Only the orchestrator mutates it.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub(crate) id: String,
    pub(crate) generation: u64,
    pub(crate) direction: CallDirection,
    pub(crate) counterpart_number: String,
    pub(crate) state: CallState,
    pub(crate) remote_call_id: Option<String>,
    pub(crate) reason: Option<CallError>,
    pub(crate) registration: Registration,
    pub(crate) signaling_confirmed: bool,
    pub(crate) service_confirmed: bool,
    pub(crate) created_at: Option<DateTime<Utc>>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
}

/// Immutable copy of a [`CallSession`] handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSessionSnapshot {
    pub id: String,
    pub generation: u64,
    pub direction: CallDirection,
    pub counterpart_number: String,
    pub state: CallState,
    pub remote_call_id: Option<String>,
    /// Why the session stopped. `UserCancelled` for a local hangup.
    pub reason: Option<CallError>,
    pub created_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSessionSnapshot {
    /// The reason to display, present only for failed sessions.
    pub fn failure_reason(&self) -> Option<&CallError> {
        match self.state {
            CallState::Failed => self.reason.as_ref(),
            _ => None,
        }
    }
}

impl CallSession {
    pub(crate) fn new(
        generation: u64,
        direction: CallDirection,
        counterpart_number: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            generation,
            direction,
            counterpart_number: counterpart_number.to_string(),
            state: CallState::Requesting,
            remote_call_id: None,
            reason: None,
            registration: Registration::Pending,
            signaling_confirmed: false,
            service_confirmed: false,
            created_at: Some(now),
            connected_at: None,
            ended_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Inbound calls are bridged by the far end, so the host answering is enough.
    pub(crate) fn ready_to_connect(&self) -> bool {
        self.signaling_confirmed
            && (self.direction == CallDirection::Inbound || self.service_confirmed)
    }

    pub(crate) fn confirm_signaling(&mut self) {
        self.signaling_confirmed = true;
        if self.registration == Registration::Pending {
            self.registration = Registration::Registered;
        }
        if self.state == CallState::Requesting {
            self.state = CallState::SignalingConfirmed;
        }
    }

    /// Records the remote id. Returns false if the service side was already settled.
    pub(crate) fn confirm_service(&mut self, remote_call_id: String) -> bool {
        if self.service_confirmed || self.remote_call_id.is_some() {
            return false;
        }
        self.remote_call_id = Some(remote_call_id);
        self.service_confirmed = true;
        if self.state == CallState::Requesting {
            self.state = CallState::ServiceConfirmed;
        }
        true
    }

    pub(crate) fn connect(&mut self, generation: u64, now: DateTime<Utc>) {
        self.generation = generation;
        self.state = CallState::Connected;
        self.connected_at = Some(now);
    }

    pub(crate) fn begin_ending(&mut self, generation: u64) {
        self.generation = generation;
        self.state = CallState::Ending;
    }

    pub(crate) fn finish(&mut self, reason: Option<CallError>, now: DateTime<Utc>) {
        self.state = CallState::Ended;
        self.reason = reason;
        self.ended_at = Some(now);
    }

    pub(crate) fn fail(&mut self, generation: u64, reason: CallError, now: DateTime<Utc>) {
        self.generation = generation;
        self.state = CallState::Failed;
        self.reason = Some(reason);
        self.ended_at = Some(now);
    }

    pub fn snapshot(&self) -> CallSessionSnapshot {
        CallSessionSnapshot {
            id: self.id.clone(),
            generation: self.generation,
            direction: self.direction,
            counterpart_number: self.counterpart_number.clone(),
            state: self.state,
            remote_call_id: self.remote_call_id.clone(),
            reason: self.reason.clone(),
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
        }
    }
}
