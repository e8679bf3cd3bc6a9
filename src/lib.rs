//! Runtime liveness layer for MCP server supervision.
//!
//! A desktop application supervising locally-running MCP servers needs three
//! things to stay honest about liveness: connections that heal themselves
//! (up to a point), dev-mode servers that restart when their source changes
//! (exactly once per burst of saves), and interactive-authorization
//! handshakes that are routable while fresh and unreachable once stale.
//! This crate provides those three components; process spawning, transports,
//! and UI live in the embedding application.
//!
//! No state here survives a process restart; these are live session
//! trackers, not storage.

pub mod runtime;

pub use runtime::{
    ConnectionMonitor, ConnectionState, DevWatcher, Elicitation, ElicitationMode,
    ElicitationRegistry, ElicitationStatus, MonitorConfig, RuntimeError, WatcherConfig,
};
