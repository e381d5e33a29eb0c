//! Stable exit codes for conductor CLI commands.

/// Command succeeded; for `run`, the judge accepted the result.
pub const OK: i32 = 0;
/// Invalid input or configuration (missing spec, bad config, no backend).
pub const CONFIG: i32 = 1;
/// Precondition failure (run locked, ambiguous task scope, missing
/// acceptance cache on resume).
pub const PRECONDITION: i32 = 2;
/// Runtime orchestration failure (dependency cycle, deadlock, integrity
/// violation, retries exhausted).
pub const RUNTIME: i32 = 3;
/// Iteration cap reached with work remaining (partial completion).
pub const PARTIAL: i32 = 4;
