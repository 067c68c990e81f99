use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 1_024;
pub const MAX_METADATA_ENTRIES: usize = 64;
pub const MAX_METADATA_VALUE_LEN: usize = 4_096;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may span at most one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Utilization reports cover at most ten years.
pub const MAX_QUERY_WINDOW_MS: Ms = 3_660 * DAY_MS;

pub const DEFAULT_BOOKING_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 1_000;

pub const DEFAULT_UPCOMING_DAYS: u32 = 7;
pub const MAX_UPCOMING_DAYS: u32 = 366;

/// Bookings listed alongside a single resource.
pub const RESOURCE_DETAIL_UPCOMING: usize = 10;
