use anyhow::{anyhow, Error, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "rustdialer.toml")]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Place an outbound call and follow it until it ends
    Dial { number: String },
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TelephonyConfig {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub callback_url: String,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bounded wait for the telephony service to confirm or reject a call.
    pub service_timeout_ms: u64,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            callback_url: "http://demo.twilio.com/docs/voice.xml".to_string(),
            request_timeout_ms: Some(10_000),
        }
    }
}

impl TelephonyConfig {
    /// Overlay credentials from the environment (and a `.env` file, if any).
    pub fn apply_env(&mut self) {
        dotenv::dotenv().ok();
        if let Ok(sid) = std::env::var("TWILIO_ACCOUNT_SID") {
            self.account_sid = sid;
        }
        if let Ok(token) = std::env::var("TWILIO_AUTH_TOKEN") {
            self.auth_token = token;
        }
        if let Ok(from) = std::env::var("TWILIO_FROM_NUMBER") {
            self.from_number = from;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(anyhow!("telephony credentials are not configured"));
        }
        if self.from_number.is_empty() {
            return Err(anyhow!("telephony from_number is not configured"));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
