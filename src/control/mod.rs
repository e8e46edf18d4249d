//! Control layer exposing device state to external tooling.

/// Device snapshots and hotplug history.
pub mod api;
/// Ratatui-based device console.
pub mod ui;
