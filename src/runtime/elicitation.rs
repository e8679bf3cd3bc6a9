//! Elicitation registry: routes interactive-authorization handshakes.
//!
//! When a backend server needs interactive input (a form, or an external URL
//! visit), the proxy assigns the request an elicitation id and must later
//! correlate the client session's answer back to the originating server.
//! This registry holds exactly that correlation (identity and liveness, no
//! request/response payloads) with a fixed TTL after which a handshake can
//! no longer be completed.
//!
//! One instance per process, constructed by the orchestrator and passed to
//! every consumer. All state is in-memory by design: elicitations are live
//! session artifacts, not durable data.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::types::{Elicitation, ElicitationMode, ElicitationStatus};

/// Fixed time-to-live for a pending elicitation (10 minutes).
pub const ELICITATION_TTL: Duration = Duration::from_millis(600_000);

// ─── ElicitationRegistry ─────────────────────────────────────────────────────

struct ElicitationEntry {
    client_session_id: String,
    backend_server_id: String,
    mode: ElicitationMode,
    status: ElicitationStatus,
    /// Monotonic creation time (drives TTL math; immune to clock changes).
    created_at: Instant,
    /// Wall-clock creation time (carried on snapshots for display).
    created_at_wall: DateTime<Utc>,
}

impl ElicitationEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > ELICITATION_TTL
    }

    fn snapshot(&self, id: &str) -> Elicitation {
        Elicitation {
            id: id.to_string(),
            client_session_id: self.client_session_id.clone(),
            backend_server_id: self.backend_server_id.clone(),
            mode: self.mode,
            status: self.status,
            created_at: self.created_at_wall,
        }
    }
}

/// Process-wide map of in-flight elicitations, keyed by caller-supplied id.
///
/// A single lock serializes every read-modify-write, so two callers can
/// never both observe and remove the same expiring entry.
pub struct ElicitationRegistry {
    entries: Mutex<HashMap<String, ElicitationEntry>>,
}

impl ElicitationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ElicitationEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new elicitation with `Pending` status.
    ///
    /// Expired entries are swept first. Re-using an existing id silently
    /// replaces the prior entry; ids are assumed unique by the caller.
    pub fn create(
        &self,
        id: impl Into<String>,
        client_session_id: impl Into<String>,
        backend_server_id: impl Into<String>,
        mode: ElicitationMode,
    ) -> Elicitation {
        self.sweep_expired();

        let id = id.into();
        let entry = ElicitationEntry {
            client_session_id: client_session_id.into(),
            backend_server_id: backend_server_id.into(),
            mode,
            status: ElicitationStatus::Pending,
            created_at: Instant::now(),
            created_at_wall: Utc::now(),
        };
        let snapshot = entry.snapshot(&id);

        let mut entries = self.lock();
        if entries.insert(id.clone(), entry).is_some() {
            tracing::warn!(elicitation = %id, "replaced existing elicitation with same id");
        } else {
            tracing::debug!(
                elicitation = %id,
                server = %snapshot.backend_server_id,
                session = %snapshot.client_session_id,
                "elicitation created"
            );
        }
        snapshot
    }

    /// Look up an elicitation, enforcing the TTL.
    ///
    /// An entry older than the TTL is marked `Expired`, removed, and reported
    /// as absent, so lookups never depend on the background sweep having run.
    pub fn get(&self, id: &str) -> Option<Elicitation> {
        let mut entries = self.lock();
        let expired = match entries.get(id) {
            None => return None,
            Some(entry) => entry.is_expired(Instant::now()),
        };
        if expired {
            if let Some(mut entry) = entries.remove(id) {
                entry.status = ElicitationStatus::Expired;
                tracing::debug!(
                    elicitation = %id,
                    server = %entry.backend_server_id,
                    "elicitation expired on lookup"
                );
            }
            return None;
        }
        entries.get(id).map(|entry| entry.snapshot(id))
    }

    /// Mark an elicitation completed and stop tracking it.
    ///
    /// Returns `false` if the id is unknown (never created, already
    /// completed/cancelled, or expired and removed).
    pub fn complete(&self, id: &str) -> bool {
        self.finish(id, ElicitationStatus::Completed)
    }

    /// Mark an elicitation cancelled and stop tracking it.
    pub fn cancel(&self, id: &str) -> bool {
        self.finish(id, ElicitationStatus::Cancelled)
    }

    fn finish(&self, id: &str, status: ElicitationStatus) -> bool {
        let mut entries = self.lock();
        match entries.remove(id) {
            Some(mut entry) => {
                entry.status = status;
                tracing::debug!(
                    elicitation = %id,
                    server = %entry.backend_server_id,
                    status = ?status,
                    "elicitation finished"
                );
                true
            }
            None => false,
        }
    }

    /// The client session that must answer this elicitation.
    ///
    /// Routes through [`get`](Self::get), so it enforces the TTL too.
    pub fn client_session(&self, id: &str) -> Option<String> {
        self.get(id).map(|e| e.client_session_id)
    }

    /// The backend server that originated this elicitation.
    ///
    /// Routes through [`get`](Self::get), so it enforces the TTL too.
    pub fn backend_server(&self, id: &str) -> Option<String> {
        self.get(id).map(|e| e.backend_server_id)
    }

    /// Remove every entry older than the TTL.
    ///
    /// Unlike lookup-triggered expiry, the sweep removes without setting a
    /// terminal status first; nothing holds the entry by then.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = entries.len(), "swept expired elicitations");
        }
    }

    /// Periodically sweep expired entries until the future is dropped.
    ///
    /// The registry never spawns tasks itself; the orchestrator spawns this
    /// as part of its own lifecycle so shutdown ordering stays explicit.
    pub async fn run_sweeper(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }

    /// Number of tracked elicitations (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for ElicitationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
