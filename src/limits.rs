//! Hard limits enforced by the engine and the SQL front end.

/// Resources per engine.
pub const MAX_RESOURCES: usize = 100_000;

/// Capacity windows plus allocations held by one resource.
pub const MAX_ENTRIES_PER_RESOURCE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 64;
pub const MAX_UNIT_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 4096;

/// Project and task references are opaque strings owned elsewhere.
pub const MAX_REFERENCE_LEN: usize = 128;

/// Skills or certifications on one resource.
pub const MAX_TAGS: usize = 64;
pub const MAX_TAG_LEN: usize = 64;

pub const MAX_SEARCH_LEN: usize = 256;

pub const MIN_VALID_YEAR: i32 = 1900;
pub const MAX_VALID_YEAR: i32 = 9999;

/// Widest capacity window or allocation, in days.
pub const MAX_SPAN_DAYS: i64 = 366 * 50;

/// Widest conflict/utilization query, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366 * 20;

pub const MAX_QUANTITY: u64 = 1_000_000_000;

/// Pending requests per optimizer run.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Snapshot-plan-apply rounds before the optimizer reports `Busy`.
pub const MAX_OPTIMIZE_ATTEMPTS: u32 = 3;
