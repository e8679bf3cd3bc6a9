//! Hot-reload file watching with debounced restarts.
//!
//! One shared `DevWatcher` manages a filesystem subscription per server
//! running in development mode. File events matching the server's watch
//! patterns are coalesced with a trailing debounce (a burst of saves
//! becomes exactly one restart, fired after the quiet period) and restarts
//! for the same server are serialized so a new firing never overlaps one
//! still in flight.
//!
//! Follows the same notify → channel → processing-task shape as the file
//! tree watcher, but keyed per server with independent teardown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use ignore::overrides::{Override, OverrideBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::errors::RuntimeError;
use super::types::WatcherConfig;

// ─── Callback type ───────────────────────────────────────────────────────────

/// Kills and relaunches the backend process for a server. Failures are
/// logged by the watcher, never propagated into the filesystem subscription.
pub type RestartFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ─── DevWatcher ──────────────────────────────────────────────────────────────

struct WatchEntry {
    /// The notify watcher; dropping it releases the OS subscription.
    watcher: Option<RecommendedWatcher>,
    /// Drains watcher events into the debounce path.
    forward_task: Option<JoinHandle<()>>,
    /// Pending debounce timer, at most one.
    debounce: Option<JoinHandle<()>>,
    /// Held across the restart callback so restarts never overlap.
    restart_gate: Arc<tokio::sync::Mutex<()>>,
}

struct WatcherShared {
    config: WatcherConfig,
    restart: RestartFn,
    entries: Mutex<HashMap<String, WatchEntry>>,
}

/// Shared manager of per-server hot-reload watches.
pub struct DevWatcher {
    shared: Arc<WatcherShared>,
}

impl DevWatcher {
    /// Create a watcher that invokes `restart` after file changes settle.
    pub fn new(
        config: WatcherConfig,
        restart: impl Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(WatcherShared {
                config,
                restart: Arc::new(restart),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start watching `patterns` (resolved against `cwd`) for `server_id`.
    ///
    /// Any existing watch for the id is fully torn down first. Only changes
    /// made after this call trigger restarts; pre-existing files never do.
    /// A watch root that cannot be subscribed is logged and observes
    /// nothing; the watch as a whole stays up for the remaining roots.
    pub fn start_watching(
        &self,
        server_id: &str,
        patterns: &[String],
        cwd: &Path,
    ) -> Result<(), RuntimeError> {
        self.stop_watching(server_id);

        // Canonicalize so event paths (which the OS reports with symlinks
        // resolved) strip cleanly against the root.
        let cwd = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let matcher = build_matcher(&cwd, patterns)?;
        let roots = watch_roots(&cwd, patterns);

        let (tx, rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    );
                    if relevant && !event.paths.is_empty() {
                        let _ = tx.send(event.paths);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "file watch event error");
                }
            }
        })
        .map_err(|e| RuntimeError::WatchSetup {
            server: server_id.to_string(),
            reason: e.to_string(),
        })?;

        for root in &roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                tracing::warn!(
                    server = server_id,
                    root = %root.display(),
                    error = %e,
                    "failed to watch directory, changes there will not trigger restarts"
                );
            }
        }

        let forward_task = spawn_forward_task(
            &self.shared,
            server_id.to_string(),
            cwd,
            matcher,
            rx,
        );

        let mut entries = self.shared.lock();
        entries.insert(
            server_id.to_string(),
            WatchEntry {
                watcher: Some(watcher),
                forward_task: Some(forward_task),
                debounce: None,
                restart_gate: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        tracing::info!(
            server = server_id,
            patterns = ?patterns,
            roots = roots.len(),
            "dev watch started"
        );
        Ok(())
    }

    /// Stop watching `server_id`: releases the filesystem subscription and
    /// cancels any pending debounce timer. Idempotent on an unwatched id.
    pub fn stop_watching(&self, server_id: &str) {
        let removed = self.shared.lock().remove(server_id);
        if let Some(entry) = removed {
            entry.teardown();
            tracing::info!(server = server_id, "dev watch stopped");
        }
    }

    /// Stop every watched server; used at shutdown.
    pub fn stop_all(&self) {
        let entries: Vec<(String, WatchEntry)> = self.shared.lock().drain().collect();
        for (server_id, entry) in entries {
            entry.teardown();
            tracing::info!(server = %server_id, "dev watch stopped");
        }
    }

    /// Whether a watch is active for `server_id`.
    pub fn is_watching(&self, server_id: &str) -> bool {
        self.shared.lock().contains_key(server_id)
    }

    /// Ids of all currently watched servers, sorted.
    pub fn watched_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for DevWatcher {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.shared.entries.lock() {
            for (_, entry) in entries.drain() {
                entry.teardown();
            }
        }
    }
}

impl WatchEntry {
    fn teardown(self) {
        if let Some(task) = self.forward_task {
            task.abort();
        }
        if let Some(timer) = self.debounce {
            timer.abort();
        }
        // OS watch released when the notify handle drops.
        drop(self.watcher);
    }
}

// ─── Debounce path ───────────────────────────────────────────────────────────

impl WatcherShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, WatchEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Funnel one file event into the debounce: replace any pending timer
    /// with a fresh one so only the last event in a burst schedules the
    /// restart ("trailing debounce").
    fn handle_change(self: &Arc<Self>, server_id: &str, path: &Path) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(server_id) else {
            return;
        };
        tracing::debug!(server = server_id, path = %path.display(), "file changed");

        if let Some(timer) = entry.debounce.take() {
            timer.abort();
        }

        let shared = Arc::clone(self);
        let sid = server_id.to_string();
        // Deadline captured now, not at first poll of the spawned task, so
        // the quiet period is measured from the event itself.
        let deadline = Instant::now() + self.config.debounce;
        entry.debounce = Some(tokio::spawn(async move {
            sleep_until(deadline).await;

            let gate = {
                let mut entries = shared.lock();
                match entries.get_mut(&sid) {
                    Some(entry) => {
                        entry.debounce = None;
                        Arc::clone(&entry.restart_gate)
                    }
                    // Watch was stopped while the timer was pending.
                    None => return,
                }
            };

            // Serialize restarts per server: a firing during an in-flight
            // restart waits for it instead of overlapping it.
            let _guard = gate.lock().await;
            tracing::info!(server = %sid, "file changes settled, restarting server");
            if let Err(e) = (shared.restart)(sid.clone()).await {
                tracing::warn!(server = %sid, error = %e, "restart callback failed");
            }
        }));
    }
}

/// Drain raw watcher events, filter them through the glob whitelist, and
/// feed matches into the debounce path.
fn spawn_forward_task(
    shared: &Arc<WatcherShared>,
    server_id: String,
    cwd: PathBuf,
    matcher: Option<Override>,
    mut rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            for path in paths {
                if path_matches(&cwd, matcher.as_ref(), &path) {
                    shared.handle_change(&server_id, &path);
                }
            }
        }
    })
}

// ─── Pattern helpers ─────────────────────────────────────────────────────────

/// Compile the watch globs into a whitelist matcher rooted at `cwd`.
///
/// `None` means "no patterns": every event under the watch roots counts.
fn build_matcher(cwd: &Path, patterns: &[String]) -> Result<Option<Override>, RuntimeError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = OverrideBuilder::new(cwd);
    for pattern in patterns {
        builder
            .add(pattern)
            .map_err(|e| RuntimeError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
    }
    let matcher = builder.build().map_err(|e| RuntimeError::InvalidPattern {
        pattern: patterns.join(", "),
        reason: e.to_string(),
    })?;
    Ok(Some(matcher))
}

fn path_matches(cwd: &Path, matcher: Option<&Override>, path: &Path) -> bool {
    let Some(matcher) = matcher else {
        return true;
    };
    // Match against the cwd-relative path; events outside cwd never match.
    let Ok(rel) = path.strip_prefix(cwd) else {
        return false;
    };
    let is_dir = path.is_dir();
    matcher.matched(rel, is_dir).is_whitelist()
}

/// Directories to subscribe for a set of globs: the literal (pre-wildcard)
/// prefix of each pattern, resolved against `cwd` and deduplicated.
fn watch_roots(cwd: &Path, patterns: &[String]) -> Vec<PathBuf> {
    if patterns.is_empty() {
        return vec![cwd.to_path_buf()];
    }
    let mut roots: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let prefix = literal_prefix(pattern);
        // A fully literal pattern names a file; watch its directory.
        let prefix = if prefix.as_os_str() == Path::new(pattern).as_os_str() {
            prefix.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            prefix
        };
        let root = if prefix.is_absolute() {
            prefix
        } else {
            cwd.join(prefix)
        };
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots
}

/// Leading path components of `pattern` containing no glob metacharacters.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(component);
    }
    prefix
}

// ─── Tests ───────────────────────────────────────────────────────────────────
