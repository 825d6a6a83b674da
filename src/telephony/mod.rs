use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod twilio;
pub use twilio::TwilioClient;


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCallRequest {
    pub from: String,
    pub to: String,
    /// Instructions document the service fetches once the far end picks up.
    pub callback_url: String,
}

/// A call accepted by the telephony service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub sid: String,
    pub status: String,
}

/// Control-plane operations against the REST telephony service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelephonyServiceClient: Send + Sync {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<RemoteCall, ServiceError>;

    /// Ask the service to terminate a call it created earlier.
    async fn hangup_call(&self, remote_call_id: &str) -> Result<(), ServiceError>;
}
