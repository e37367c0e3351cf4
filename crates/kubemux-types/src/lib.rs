//! Shared types for kubemux
//!
//! This crate contains data structures used across multiple kubemux crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Connection Types
// ============================================================================

/// SSH endpoint used to tunnel cluster API traffic.
///
/// Only the path to the private key is held here; key material itself is
/// never loaded into a connection record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: String,
}

impl SshEndpoint {
    pub fn new(host: String, port: u16, username: String, private_key_path: String) -> Self {
        Self {
            host,
            port,
            username,
            private_key_path,
        }
    }

    /// Format as `user@host` for the ssh command line
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// A cluster connection definition
///
/// When `ssh` is present, all cluster API traffic for this connection must
/// route through a tunnel keyed by this connection's id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshEndpoint>,
    /// Raw kubeconfig document for this cluster
    pub kubeconfig: String,
}

impl Connection {
    pub fn new(id: String, name: String, kubeconfig: String) -> Self {
        Self {
            id,
            name,
            ssh: None,
            kubeconfig,
        }
    }

    pub fn with_ssh(mut self, ssh: SshEndpoint) -> Self {
        self.ssh = Some(ssh);
        self
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Coordinate of one container's log feed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl LogTarget {
    pub fn new(namespace: String, pod: String, container: String) -> Self {
        Self {
            namespace,
            pod,
            container,
        }
    }
}

impl std::fmt::Display for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Streaming parameters for a log session
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    /// Continuous tail vs. one-shot fetch
    pub follow: bool,
    /// Server-side time filter for the initial fetch
    pub since_time: Option<DateTime<Utc>>,
    /// Server-side line cap on the initial fetch
    pub tail_lines: Option<i64>,
}

// ============================================================================
// Parsed Log Lines
// ============================================================================

/// A payload span, either plain text or a hyperlink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineSegment {
    Text(String),
    Link(String),
}

/// A classified log line, derived from raw text and never persisted
#[derive(Clone, Debug)]
pub struct ParsedLogLine {
    /// Original raw line
    pub raw: String,

    /// Leading timestamp span, when one was recognized
    pub timestamp: Option<String>,

    /// Byte offset where the timestamp span ends (0 when none matched);
    /// the displayed payload is `raw[timestamp_end..]`
    pub timestamp_end: usize,

    /// Error heuristic, only evaluated when no timestamp matched
    pub is_error: bool,

    /// Payload split into text and link spans
    pub segments: Vec<LineSegment>,
}

impl ParsedLogLine {
    /// The displayed payload after the timestamp span
    pub fn payload(&self) -> &str {
        &self.raw[self.timestamp_end..]
    }
}

// ============================================================================
// Events
// ============================================================================

/// Per-session events from the log session manager
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A raw log line arrived for the session
    Data { session_id: String, line: String },
    /// A transport-level error scoped to the session
    Error { session_id: String, message: String },
    /// The remote stream ended (pod terminated or one-shot fetch done)
    Closed { session_id: String },
}

/// Per-session events from a sandboxed filter process
#[derive(Clone, Debug)]
pub enum FilterEvent {
    /// A filtered stdout line
    Data { session_id: String, line: String },
    /// A stderr line from the filter process
    Diagnostic { session_id: String, message: String },
    /// The filter process exited while still registered
    Exited {
        session_id: String,
        code: Option<i32>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Data { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Closed { session_id } => session_id,
        }
    }
}

impl FilterEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Data { session_id, .. }
            | Self::Diagnostic { session_id, .. }
            | Self::Exited { session_id, .. } => session_id,
        }
    }
}
