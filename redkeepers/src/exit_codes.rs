//! Stable exit codes for redkeepers CLI commands.

/// Command succeeded (including a drained queue or a dry run).
pub const OK: i32 = 0;
/// Lock held by another process, invalid documents, or any other fatal error.
pub const FATAL: i32 = 1;
/// Preflight found problems; no item was touched.
pub const PREFLIGHT_FAILED: i32 = 2;
