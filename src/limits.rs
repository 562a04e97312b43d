use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest single appointment (a year, covers long-running blocks).
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;

/// Upper bound on the SlotFinder look-ahead.
pub const MAX_SEARCH_HORIZON_DAYS: u32 = 3_660;
pub const DEFAULT_SEARCH_HORIZON_DAYS: u32 = 90;

/// Longest a family may stay on hold.
pub const MAX_OFFER_HOLD_MS: Ms = 30 * DAY_MS;

/// Offer indices are single decimal digits.
pub const MAX_OFFER_HORIZONS: usize = 10;

/// Search-then-reserve retries when a concurrent writer took the slot.
pub const MAX_BOOKING_ATTEMPTS: usize = 8;
