use super::{CreateCallRequest, RemoteCall, TelephonyServiceClient};
use crate::config::TelephonyConfig;
use crate::error::ServiceError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const API_VERSION: &str = "2010-04-01";

/// REST client for a Twilio-compatible voice API.
pub struct TwilioClient {
    base_url: String,
    account_sid: String,
    auth_header: String,
    client: Client,
}

#[derive(Deserialize)]
struct CallResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioClient {
    pub fn new(config: &TelephonyConfig) -> Self {
        let timeout = config
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_header: basic_auth(&config.account_sid, &config.auth_token),
            client,
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/{}/Accounts/{}/Calls.json",
            self.base_url, API_VERSION, self.account_sid
        )
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/{}/Accounts/{}/Calls/{}.json",
            self.base_url, API_VERSION, self.account_sid, call_sid
        )
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<String, ServiceError> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                warn!(url, "telephony request failed: {}", e);
                ServiceError::Network(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        info!(
            url,
            status = status.as_u16(),
            elapsed = start.elapsed().as_millis(),
            "telephony request completed"
        );
        if status.is_success() {
            Ok(body)
        } else {
            Err(map_status(status, body))
        }
    }
}

pub(crate) fn basic_auth(account_sid: &str, auth_token: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", account_sid, auth_token))
    )
}

pub(crate) fn map_status(status: StatusCode, body: String) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED => ServiceError::AuthFailure,
        StatusCode::BAD_REQUEST => ServiceError::BadRequest(body),
        StatusCode::NOT_FOUND => ServiceError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited,
        other => ServiceError::ServerError(other.as_u16()),
    }
}

#[async_trait]
impl TelephonyServiceClient for TwilioClient {
    async fn create_call(&self, request: &CreateCallRequest) -> Result<RemoteCall, ServiceError> {
        let url = self.calls_url();
        let body = self
            .post_form(
                &url,
                &[
                    ("From", request.from.as_str()),
                    ("To", request.to.as_str()),
                    ("Url", request.callback_url.as_str()),
                ],
            )
            .await?;
        let resource: CallResource = serde_json::from_str(&body).map_err(|e| {
            warn!(url, "unexpected call resource: {}", e);
            ServiceError::BadRequest(format!("malformed call resource: {}", e))
        })?;
        info!(remote_call_id = resource.sid, to = request.to, "remote call created");
        Ok(RemoteCall {
            sid: resource.sid,
            status: resource.status.unwrap_or_else(|| "queued".to_string()),
        })
    }

    async fn hangup_call(&self, remote_call_id: &str) -> Result<(), ServiceError> {
        self.post_form(&self.call_url(remote_call_id), &[("Status", "completed")])
            .await?;
        info!(remote_call_id, "remote call completed");
        Ok(())
    }
}
