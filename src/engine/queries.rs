use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{is_free, is_free_from, matches_type};
use super::conflict::{find_conflict, validate_stay};
use super::{Engine, EngineError};

impl Engine {
    // ── Availability ─────────────────────────────────────────

    /// Rooms with no booking overlapping `[check_in, check_out)`, optionally
    /// restricted to one room type. Sorted by room id.
    pub async fn find_available_rooms(
        &self,
        check_in: Date,
        check_out: Date,
        room_type: Option<&str>,
    ) -> Result<Vec<RoomInfo>, EngineError> {
        let window = validate_stay(check_in, check_out)?;
        if window.nights() > MAX_SEARCH_NIGHTS {
            return Err(EngineError::LimitExceeded("search window too wide"));
        }

        let mut available = Vec::new();
        for rs in self.store.all() {
            let guard = rs.read().await;
            if matches_type(&guard.room, room_type) && is_free(&guard, &window) {
                available.push(RoomInfo::from(&guard.room));
            }
        }
        Ok(available)
    }

    /// Rooms with no booking checking out after today.
    pub async fn list_all_available_rooms(&self) -> Vec<RoomInfo> {
        let today = self.today();
        let mut available = Vec::new();
        for rs in self.store.all() {
            let guard = rs.read().await;
            if is_free_from(&guard, today) {
                available.push(RoomInfo::from(&guard.room));
            }
        }
        available
    }

    /// Whether any booking on `room_id` other than `excluding` overlaps the stay.
    pub async fn room_has_conflict(
        &self,
        room_id: Ulid,
        check_in: Date,
        check_out: Date,
        excluding: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let stay = validate_stay(check_in, check_out)?;
        let rs = self
            .store
            .get(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &stay, excluding).is_some())
    }

    // ── Rooms ────────────────────────────────────────────────

    /// Newest room first.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut rooms = Vec::new();
        for rs in self.store.all().into_iter().rev() {
            rooms.push(RoomInfo::from(&rs.read().await.room));
        }
        rooms
    }

    /// The room with every booking that references it.
    pub async fn get_room(&self, id: Ulid) -> Result<RoomDetail, EngineError> {
        let rs = self.store.get(&id).ok_or(EngineError::NotFound(id))?;
        let today = self.today();
        let guard = rs.read().await;
        Ok(RoomDetail {
            room: RoomInfo::from(&guard.room),
            bookings: guard
                .bookings
                .iter()
                .map(|b| BookingInfo::new(b, today))
                .collect(),
        })
    }

    pub async fn room_types(&self) -> Vec<String> {
        self.store.find_distinct_types().await.into_iter().collect()
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn find_booking_by_code(&self, code: &str) -> Result<BookingInfo, EngineError> {
        let booking = self
            .store
            .find_by_confirmation_code(code)
            .await
            .ok_or_else(|| EngineError::UnknownConfirmationCode(code.to_string()))?;
        Ok(BookingInfo::new(&booking, self.today()))
    }

    pub async fn bookings_for_room(&self, room_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        if !self.store.contains(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        let today = self.today();
        Ok(self
            .store
            .find_by_room(&room_id)
            .await
            .iter()
            .map(|b| BookingInfo::new(b, today))
            .collect())
    }

    /// A guest's booking history, ordered by check-in.
    pub async fn bookings_for_guest(&self, guest: &str) -> Vec<BookingInfo> {
        self.collect_bookings(|b| b.guest == guest).await
    }

    /// Every booking, ordered by check-in.
    pub async fn list_bookings(&self) -> Vec<BookingInfo> {
        self.collect_bookings(|_| true).await
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<BookingInfo> {
        let today = self.today();
        let mut found = Vec::new();
        for rs in self.store.all() {
            let guard = rs.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| keep(b))
                    .map(|b| BookingInfo::new(b, today)),
            );
        }
        found.sort_by(|a, b| a.check_in.cmp(&b.check_in).then(a.id.cmp(&b.id)));
        found
    }
}
