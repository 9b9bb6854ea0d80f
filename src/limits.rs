use crate::model::Ms;

pub const MAX_AIRCRAFT: usize = 10_000;
pub const MAX_TAIL_NUMBER_LEN: usize = 16;
/// Make and model strings.
pub const MAX_DESCRIPTOR_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_RESERVATIONS_PER_AIRCRAFT: usize = 100_000;
pub const MAX_USAGE_RECORDS_PER_AIRCRAFT: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Ninety days.
pub const MAX_SPAN_DURATION_MS: Ms = 90 * 24 * 60 * 60 * 1000;

/// Longest accepted request line on the wire.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
