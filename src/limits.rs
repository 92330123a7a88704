//! Hard caps on input sizes and state growth.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 20_000;

pub const MAX_ROOM_TYPE_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_PHOTO_URL_LEN: usize = 2_048;
pub const MAX_GUEST_REF_LEN: usize = 256;

/// Longest single stay that can be admitted.
pub const MAX_STAY_NIGHTS: i64 = 365;
/// Widest window an availability search may cover.
pub const MAX_SEARCH_NIGHTS: i64 = 3 * 365;

pub const CONFIRMATION_CODE_LEN: usize = 10;
/// Give up generating a fresh confirmation code after this many collisions.
pub const MAX_CODE_ATTEMPTS: usize = 32;
