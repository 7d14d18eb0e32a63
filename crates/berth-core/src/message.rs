//! JSON wire messages of the control API.
//!
//! All commands are POSTs with a JSON body; malformed input is reported via
//! the status bitmask in a regular 200 response, never as a transport-level
//! error, so handlers parse the raw body with [`serde_json`] themselves.
//!
//! Credentials never reach disk or logs in the clear: any rendering of a
//! credential-bearing message for persistence goes through [`masked`]
//! copies, while the in-memory value keeps the real values.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::AppState;
use crate::status::StatusCode;

/// Replacement value for credential fields in persisted/logged renderings.
pub const CREDENTIAL_MASK: &str = "***";

/// All validation problems of one message, collected together.
#[derive(Debug, Error)]
#[error("{}", issues.join("\n"))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

/// Current instant in the ISO-8601 form used across the wire and the
/// audit log.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn check_timestamp(timestamp: &str, issues: &mut Vec<String>) {
    if DateTime::parse_from_rfc3339(timestamp).is_err() {
        issues.push("Timestamp is not well-formed.".to_string());
    }
}

fn check_credentials(username: &str, password: &str, issues: &mut Vec<String>) {
    if username.trim().is_empty() {
        issues.push("Missing username.".to_string());
    }
    if password.trim().is_empty() {
        issues.push("Missing password.".to_string());
    }
}

fn check_repository_url(url: &str, issues: &mut Vec<String>) {
    let well_formed = ["http://", "https://", "ssh://", "git://", "file://"]
        .iter()
        .any(|scheme| {
            url.strip_prefix(scheme)
                .is_some_and(|rest| !rest.is_empty() && !rest.contains(char::is_whitespace))
        });
    if !well_formed {
        issues.push("Git repository URL is not well-formed.".to_string());
    }
}

fn check_payload(payload: &str, issues: &mut Vec<String>) {
    if serde_json::from_str::<serde_json::Value>(payload).is_err() {
        issues.push("Payload is not valid JSON.".to_string());
    }
}

fn finish(issues: Vec<String>) -> Result<(), ValidationError> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}

/// Body of `/register/git`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub timestamp: String,
    #[serde(rename = "gitRepositoryUrl")]
    pub git_repository_url: String,
    pub username: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        check_timestamp(&self.timestamp, &mut issues);
        check_repository_url(&self.git_repository_url, &mut issues);
        check_credentials(&self.username, &self.password, &mut issues);
        finish(issues)
    }

    /// Copy with credentials blanked, safe to persist or log.
    pub fn masked(&self) -> Self {
        Self {
            username: CREDENTIAL_MASK.to_string(),
            password: CREDENTIAL_MASK.to_string(),
            ..self.clone()
        }
    }
}

/// Body of `/update/git`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub timestamp: String,
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    pub username: String,
    pub password: String,
}

impl UpdateRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        check_timestamp(&self.timestamp, &mut issues);
        check_credentials(&self.username, &self.password, &mut issues);
        finish(issues)
    }

    pub fn masked(&self) -> Self {
        Self {
            username: CREDENTIAL_MASK.to_string(),
            password: CREDENTIAL_MASK.to_string(),
            ..self.clone()
        }
    }
}

/// Body of `/status`, `/delete`, `/compile`, `/deploy`, `/start`, `/stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UuidRequest {
    pub timestamp: String,
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
}

impl UuidRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        check_timestamp(&self.timestamp, &mut issues);
        finish(issues)
    }
}

/// Body of `/dispatch`. `payload` is forwarded to the workload verbatim
/// but must itself be valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub timestamp: String,
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    pub payload: String,
}

impl DispatchRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        check_timestamp(&self.timestamp, &mut issues);
        check_payload(&self.payload, &mut issues);
        finish(issues)
    }
}

/// Response body shared by every command.
///
/// `statuscode` is the accumulated bitmask (0 = success); `dataAppState`
/// is present for `/status`, `payload` for `/dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub timestamp: String,
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    pub statuscode: u64,
    pub message: String,
    #[serde(rename = "dataAppState", skip_serializing_if = "Option::is_none")]
    pub data_app_state: Option<AppState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl LifecycleResponse {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            timestamp: now_timestamp(),
            uuid,
            statuscode: 0,
            message: String::new(),
            data_app_state: None,
            payload: None,
        }
    }

    /// Embed the accumulated status and refresh the timestamp; the last
    /// step of every command.
    pub fn finalize(mut self, status: &StatusCode) -> Self {
        self.statuscode = status.code();
        self.message = status.message();
        self.timestamp = now_timestamp();
        self
    }
}
