use crate::model::{DAY_MS, Ms};

/// Earliest accepted instant (the epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Exclusive upper bound: 10000-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_800_000;

/// Longest single stay.
pub const MAX_STAY_MS: Ms = 366 * DAY_MS;
/// Widest availability query window.
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * DAY_MS;

pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_ROOMS: usize = 1_000_000;
pub const MAX_ROOM_NUMBER_LEN: usize = 64;

/// First try plus one retry after a serialization conflict.
pub const MAX_RESERVE_ATTEMPTS: u32 = 2;
