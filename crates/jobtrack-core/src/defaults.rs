//! Centralized default constants for jobtrack.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// POLLING
// =============================================================================

/// Interval between two progress polls of the same job class (milliseconds).
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Consecutive "not started" observations after which a unit of a fresh
/// episode is considered gone (job list changed or truncated server-side).
pub const NOT_STARTED_LIMIT: u32 = 30;

/// Consecutive "not started" observations tolerated after recovery.
///
/// A job can finish and have its progress record cleaned up while the client
/// process is down, so recovered episodes give up much sooner.
pub const RECOVERY_NOT_STARTED_LIMIT: u32 = 3;

/// Status substrings that mark a unit as finished, compared after case and
/// accent folding. The backend reports French statuses ("Terminé", "Terminée").
pub const TERMINAL_MARKERS: &[&str] = &["termine", "done", "finished"];

/// Clear server-side progress records once an episode has finished.
pub const RESET_ON_FINISH: bool = true;

// =============================================================================
// REMOTE SERVICE
// =============================================================================

/// Default backend base URL.
pub const API_BASE_URL: &str = "http://localhost:8000";

/// Timeout for a single request to the backend (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Prefix of every persisted key; the job class name is appended.
pub const STORAGE_KEY_PREFIX: &str = "jobtrack:";

/// Default directory for the file-backed store (relative to the working dir).
pub const STATE_DIR: &str = ".jobtrack";

// =============================================================================
// EVENTS
// =============================================================================

/// Capacity of the coordinator event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;
