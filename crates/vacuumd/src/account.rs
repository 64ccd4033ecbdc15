//! Vendor account web API client.
//!
//! Covers the bootstrap flow (email verification code, code-for-session
//! exchange) and home-data discovery. The session token is an opaque JSON
//! blob stored verbatim; this module never interprets it beyond handing it
//! to the cloud transport.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::device::DeviceDescriptor;

const DEFAULT_BASE_URL: &str = "https://account.vacuumhome.example";

/// Vendor API status codes, from observed responses.
const API_OK: i64 = 200;
const API_ACCOUNT_NOT_FOUND: i64 = 2008;
const API_INVALID_EMAIL: i64 = 2012;
const API_INVALID_CODE: i64 = 2018;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no account exists for this username")]
    AccountNotFound,

    #[error("username is not a valid email address")]
    InvalidEmailFormat,

    #[error("the verification code was not accepted")]
    InvalidCode,

    #[error("account service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected account service response: {0}")]
    Unknown(String),
}

impl AccountError {
    /// Stable machine-readable code for inline form errors.
    pub fn error_code(&self) -> &'static str {
        match self {
            AccountError::AccountNotFound => "account_not_found",
            AccountError::InvalidEmailFormat => "invalid_email_format",
            AccountError::InvalidCode => "invalid_code",
            AccountError::Transport(_) => "cannot_connect",
            AccountError::Unknown(_) => "unknown",
        }
    }
}

/// A validated session produced by the code exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Opaque token blob, stored verbatim.
    pub token: Value,

    /// Base URL the rest of the session must talk to.
    pub base_url: String,
}

/// Response envelope shared by every account endpoint.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

pub struct AccountClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
}

impl AccountClient {
    pub fn new(username: &str) -> Self {
        Self::with_base_url(username, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(username: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
        }
    }

    /// Ask the vendor to email a verification code to the account.
    pub async fn request_verification(&self) -> Result<(), AccountError> {
        debug!(username = %self.username, "requesting verification code");
        let envelope = self
            .post(
                "/api/v1/send_code",
                json!({ "username": self.username }),
            )
            .await?;
        check_envelope(&envelope)?;
        Ok(())
    }

    /// Exchange the emailed code for session credentials.
    pub async fn exchange_code(&self, code: &str) -> Result<SessionCredentials, AccountError> {
        debug!(username = %self.username, "logging in with emailed code");
        let envelope = self
            .post(
                "/api/v1/login_with_code",
                json!({ "username": self.username, "code": code }),
            )
            .await?;
        check_envelope(&envelope)?;

        let base_url = envelope
            .data
            .get("base_url")
            .and_then(Value::as_str)
            .unwrap_or(&self.base_url)
            .to_string();
        Ok(SessionCredentials {
            token: envelope.data,
            base_url,
        })
    }

    /// Enumerate the devices of an authenticated account.
    pub async fn get_home_data(
        &self,
        session: &SessionCredentials,
    ) -> Result<Vec<DeviceDescriptor>, AccountError> {
        let envelope = self
            .post(
                "/api/v1/home_data",
                json!({ "token": session.token }),
            )
            .await?;
        check_envelope(&envelope)?;

        let devices = envelope
            .data
            .get("devices")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(devices)
            .map_err(|e| AccountError::Unknown(format!("bad home data: {e}")))
    }

    async fn post(&self, path: &str, body: Value) -> Result<ApiEnvelope, AccountError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Map a vendor status code onto the error taxonomy.
fn check_envelope(envelope: &ApiEnvelope) -> Result<(), AccountError> {
    match envelope.code {
        API_OK => Ok(()),
        API_ACCOUNT_NOT_FOUND => Err(AccountError::AccountNotFound),
        API_INVALID_EMAIL => Err(AccountError::InvalidEmailFormat),
        API_INVALID_CODE => Err(AccountError::InvalidCode),
        other => Err(AccountError::Unknown(format!(
            "code {other}: {}",
            envelope.msg
        ))),
    }
}
