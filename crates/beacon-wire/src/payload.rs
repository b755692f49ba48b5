//! Structured payload records carried by requests and responses.
//!
//! Payloads are serialized with a self-describing encoding, so fields may be
//! added over the life of the protocol. New fields must be `#[serde(default)]`
//! to keep older peers decodable.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identity record an agent reports during the controller handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicIdentity {
    /// Durable machine identifier, stable across agent restarts.
    pub fingerprint: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub administrator: bool,
    #[serde(default)]
    pub language: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl BasicIdentity {
    /// `user@host`, falling back to whichever half is known.
    pub fn display_name(&self) -> String {
        match (self.username.is_empty(), self.hostname.is_empty()) {
            (false, false) => format!("{}@{}", self.username, self.hostname),
            (false, true) => self.username.clone(),
            (true, false) => self.hostname.clone(),
            (true, true) => self.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub identity: BasicIdentity,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub logical_cores: u32,
    /// Installed memory in MiB; zero when the host does not report it.
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandRequest {
    pub command: String,
    /// Spawn and return immediately instead of waiting for output.
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub url: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadFileResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAndExecuteRequest {
    pub url: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAndExecuteResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl DownloadAndExecuteResult {
    pub fn launched(pid: Option<u32>) -> Self {
        Self {
            success: true,
            error: None,
            pid,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            pid: None,
        }
    }
}
