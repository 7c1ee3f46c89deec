//! Hard bounds on input sizes and store growth.

use crate::model::Ms;

pub const MAX_CASES: usize = 100_000;
pub const MAX_TASKS_PER_CASE: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTIFICATION_LEN: usize = 1024;

/// Default page size for notification reads.
pub const NOTIFICATION_LIMIT: usize = 50;
pub const MAX_NOTIFICATION_LIMIT: usize = 1000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Upper bound on a single task window or a case envelope (7 days).
pub const MAX_WINDOW_MS: Ms = 7 * 24 * 3_600_000;

// ── Suggested plans ──────────────────────────────────────────

pub const MAX_SUGGESTED_TASKS: usize = 32;
/// Offsets farther than two days from the requested time are rejected.
pub const MAX_OFFSET_MINUTES: i64 = 2 * 24 * 60;
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

pub const MAX_QUERY_LEN: usize = 64 * 1024;
