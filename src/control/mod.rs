//! Control layer exposing station state to operators and tooling.

/// Status snapshots and channel toggles.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
