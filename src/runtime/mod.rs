//! Runtime liveness and coordination layer.
//!
//! Three independently schedulable components, each owning its own keyed
//! state and guaranteeing at most one outstanding timer/action per entity:
//!
//! - [`ConnectionMonitor`]: per-connection state machine with bounded
//!   exponential-backoff reconnection
//! - [`DevWatcher`]: per-server file watching with debounced hot-reload
//!   restarts
//! - [`ElicitationRegistry`]: TTL-bounded routing state for interactive
//!   authorization handshakes
//!
//! The orchestrator composes them: it owns one monitor per backend
//! connection, one shared watcher, and one shared registry, and supplies
//! the reconnect/restart callbacks. The components never call each other.

pub mod elicitation;
pub mod errors;
pub mod monitor;
pub mod types;
pub mod watcher;

// Re-exports for convenience
pub use elicitation::{ElicitationRegistry, ELICITATION_TTL};
pub use errors::RuntimeError;
pub use monitor::{ConnectionMonitor, ReconnectFn, StateChangeFn};
pub use types::{
    ConnectionState, Elicitation, ElicitationMode, ElicitationStatus, MonitorConfig,
    WatcherConfig,
};
pub use watcher::{DevWatcher, RestartFn};
