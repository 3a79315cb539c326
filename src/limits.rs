use crate::model::Ms;

pub const MAX_ORGANIZATIONS: usize = 10_000;
pub const MAX_ORG_NAME_LEN: usize = 256;

pub const MAX_INSTRUCTORS_PER_ORG: usize = 100_000;
pub const MAX_INSTRUCTORS_PER_REQUEST: usize = 32;
pub const MAX_INTERVALS_PER_INSTRUCTOR: usize = 50_000;

pub const MAX_REASON_LEN: usize = 1_024;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
