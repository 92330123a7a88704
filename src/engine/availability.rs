use crate::model::*;

// ── Availability predicates ──────────────────────────────────────

/// A room is free for `stay` when none of its bookings overlap it.
pub fn is_free(rs: &RoomState, stay: &StayRange) -> bool {
    rs.overlapping(stay).next().is_none()
}

/// A room is free from `today` on when every booking has checked out by then.
pub fn is_free_from(rs: &RoomState, today: Date) -> bool {
    !rs.occupied_from(today)
}

/// Exact, case-sensitive type match. `None` or an empty filter matches all.
pub fn matches_type(room: &Room, room_type: Option<&str>) -> bool {
    match room_type {
        None | Some("") => true,
        Some(wanted) => room.room_type == wanted,
    }
}
