//! Shared types for the runtime liveness layer.
//!
//! Connection/elicitation state enums are `Serialize` so the frontend can
//! render them directly; config structs carry the defaults the orchestrator
//! can override at construction time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle state of a single backend server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The transport is up.
    Connected,
    /// The transport dropped; automatic reconnection is in progress.
    Reconnecting,
    /// All reconnect attempts are exhausted. Terminal; requires manual
    /// intervention (user-triggered reconnect or server restart).
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tuning knobs for the reconnect backoff loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Reconnect attempts before giving up and entering `Failed`.
    pub max_retries: u32,
    /// First backoff delay (doubles each attempt).
    pub initial_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

// ─── Dev Watcher ─────────────────────────────────────────────────────────────

/// Tuning knobs for hot-reload file watching.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last file event before a restart fires.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

// ─── Elicitations ────────────────────────────────────────────────────────────

/// How the user is asked to respond to an elicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationMode {
    /// Structured form rendered in the client.
    Form,
    /// External URL the user must visit (OAuth-style flows).
    Url,
}

/// Status of an in-flight elicitation handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationStatus {
    Pending,
    Completed,
    Expired,
    Cancelled,
}

/// Snapshot of a tracked elicitation, as handed to callers.
///
/// Holds routing identity only; the request/response payloads flow through
/// the proxy and are never stored here.
#[derive(Debug, Clone, Serialize)]
pub struct Elicitation {
    /// Caller-supplied unique id.
    pub id: String,
    /// Client session that must answer the elicitation.
    pub client_session_id: String,
    /// Backend server that originated it.
    pub backend_server_id: String,
    pub mode: ElicitationMode,
    pub status: ElicitationStatus,
    /// Wall-clock creation time (display/telemetry; TTL math is monotonic).
    pub created_at: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        let back: ConnectionState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ConnectionState::Failed);
    }

    #[test]
    fn test_connection_state_display_matches_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn test_monitor_config_defaults() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.initial_delay, Duration::from_millis(1000));
        assert_eq!(cfg.max_delay, Duration::from_millis(30_000));
    }

    #[test]
    fn test_watcher_config_default_debounce() {
        assert_eq!(WatcherConfig::default().debounce, Duration::from_millis(500));
    }

    #[test]
    fn test_elicitation_snapshot_serialization() {
        let snap = Elicitation {
            id: "elic-1".into(),
            client_session_id: "session-a".into(),
            backend_server_id: "filesystem".into(),
            mode: ElicitationMode::Url,
            status: ElicitationStatus::Pending,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"mode\":\"url\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"client_session_id\":\"session-a\""));
    }
}
