use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not span more than one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_CONTACT_LEN: usize = 255;
pub const MAX_REQUESTER_LEN: usize = 255;
pub const MAX_NOTES_LEN: usize = 4096;

/// Upper bound on one encoded WAL event. Well above the largest booking the
/// field limits allow.
pub const MAX_WAL_RECORD_BYTES: usize = 64 * 1024;
