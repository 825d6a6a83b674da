use serde::Serialize;
use thiserror::Error;

/// Failure categories reported by the telephony REST service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    AuthFailure,
    #[error("network failure: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited,
    #[error("server error: {0}")]
    ServerError(u16),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("resource not found")]
    NotFound,
}

/// Rejection of a call intent by the host call UI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling rejected: {0}")]
pub struct SignalingError(pub String);

/// Reasons a call session stops, as seen by the caller of the orchestrator.
///
/// Only [`CallError::SessionAlreadyActive`] is ever returned directly; every
/// other variant is recorded on the session and observed through its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CallError {
    #[error("a call session is already active")]
    SessionAlreadyActive,
    #[error("call rejected by the system call UI: {0}")]
    SignalingRejected(String),
    #[error("telephony credentials were rejected")]
    ServiceAuthFailure,
    #[error("telephony service unreachable: {0}")]
    ServiceNetworkFailure(String),
    #[error("telephony service rate limited the request")]
    ServiceRateLimited,
    #[error("telephony service error (status {0})")]
    ServiceServerError(u16),
    #[error("telephony service rejected the request: {0}")]
    ServiceBadRequest(String),
    #[error("telephony resource not found")]
    ServiceNotFound,
    #[error("telephony service did not answer in time")]
    ServiceTimeout,
    #[error("call cancelled by user")]
    UserCancelled,
}

impl CallError {
    /// Whether re-invoking `start_outgoing_call` may succeed without reconfiguration.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CallError::ServiceAuthFailure | CallError::UserCancelled | CallError::SessionAlreadyActive
        )
    }

    /// Whether the UI should ask for credentials again.
    pub fn requires_credentials(&self) -> bool {
        matches!(self, CallError::ServiceAuthFailure)
    }
}

impl From<ServiceError> for CallError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::AuthFailure => CallError::ServiceAuthFailure,
            ServiceError::Network(detail) => CallError::ServiceNetworkFailure(detail),
            ServiceError::RateLimited => CallError::ServiceRateLimited,
            ServiceError::ServerError(code) => CallError::ServiceServerError(code),
            ServiceError::BadRequest(detail) => CallError::ServiceBadRequest(detail),
            ServiceError::NotFound => CallError::ServiceNotFound,
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        CallError::SignalingRejected(e.0)
    }
}
