//! Versioned wire schema between the host and the worker
//!
//! Both directions are JSON objects. Requests carry `"version"` and a
//! `"type"` tag; messages carry `"version"`, the connection's `"seq"`, the
//! originating `"requestId"` when there is one, and an `"event"` tag.

use serde::{Deserialize, Serialize};

use crate::download::{DownloadHandle, DownloadKey, ManagerStats, Snapshot};
use crate::error::{DownloadError, ErrorKind};
use crate::source::{Kind, Service, UpstreamRef};

/// Current schema version; anything else is rejected
pub const PROTOCOL_VERSION: u32 = 1;

/// Host → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    /// Start (or join) a download
    Download { service: Service, kind: Kind, id: u64 },
    GetAll,
    GetById { service: Service, kind: Kind, id: u64 },
    /// Drop a finished download and its asset references
    Remove { service: Service, kind: Kind, id: u64 },
    /// Say what a numeric id stands for on services with non-numeric ids
    Register { id: u64, target: UpstreamRef },
    Status,
    /// Stop the worker
    Destroy,
}

impl Request {
    pub fn new(request_id: impl Into<String>, command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: Some(request_id.into()),
            command,
        }
    }

    /// Parse one ingress line.
    ///
    /// On failure the request id is still recovered when the line was at
    /// least a JSON object carrying one, so the error can be correlated.
    pub fn parse(text: &str) -> Result<Self, (Option<String>, DownloadError)> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| (None, DownloadError::invalid_argument(format!("Malformed JSON: {}", e))))?;

        let request_id = value
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(u64::from(PROTOCOL_VERSION)) {
            return Err((
                request_id,
                DownloadError::invalid_argument(format!(
                    "Unsupported protocol version {:?}, expected {}",
                    version, PROTOCOL_VERSION
                )),
            ));
        }

        serde_json::from_value(value).map_err(|e| {
            (
                request_id,
                DownloadError::invalid_argument(format!("Invalid request: {}", e)),
            )
        })
    }
}

/// Worker → host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub version: u32,
    /// Starts at 1 and increases by one per message on a connection
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Reply to `download`: which run now tracks the key
    Accepted { handle: DownloadHandle },
    /// A download changed
    Download { snapshot: Snapshot },
    /// Reply to `get-all`
    Downloads { downloads: Vec<Snapshot> },
    /// Reply to `get-by-id`
    Snapshot { snapshot: Snapshot },
    Removed { key: DownloadKey },
    Registered { key: DownloadKey },
    #[serde(rename_all = "camelCase")]
    Status {
        worker_version: String,
        services: Vec<Service>,
        stats: ManagerStats,
    },
    Error { kind: ErrorKind, message: String },
    /// Events were dropped for this connection; re-query with `get-all`
    Resync { missed: u64 },
    Destroyed,
}

impl Event {
    pub fn error(error: &DownloadError) -> Self {
        Event::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
