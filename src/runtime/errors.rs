//! Runtime liveness error types.
//!
//! Only setup-time failures surface as errors. Callback failures (reconnect
//! attempts, restart attempts) are swallowed and logged at the operation
//! boundary; the observable failure signals are state transitions and
//! boolean returns, never exceptions.

use thiserror::Error;

/// Errors that can occur while operating the runtime liveness layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Establishing a filesystem watch failed (missing directory, OS limit).
    #[error("failed to watch files for server '{server}': {reason}")]
    WatchSetup {
        server: String,
        reason: String,
    },

    /// A watch glob pattern could not be compiled.
    #[error("invalid watch pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },
}
