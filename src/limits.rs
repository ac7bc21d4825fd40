use crate::model::{DAY_MS, Ms};

/// Earliest accepted instant (1970-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Latest accepted instant (year 10000).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_800_000;

pub const MAX_SPAN_DURATION_MS: Ms = 50 * 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 50 * 366 * DAY_MS;

pub const MAX_ALLOCATIONS_PER_EMPLOYEE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 1024;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 200;
