use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// A room and its bookings behind one lock: the unit of admission serialization.
pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Rooms keyed by id, plus the booking-id and confirmation-code indexes.
///
/// The engine never touches the maps directly. Bookings live inside their
/// room's state; the indexes only point at them.
pub struct InMemoryStore {
    rooms: DashMap<Ulid, SharedRoomState>,
    booking_to_room: DashMap<Ulid, Ulid>,
    /// Confirmation code → booking id.
    codes: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            codes: DashMap::new(),
        }
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Insert a room with its bookings and index them.
    pub fn save(&self, state: RoomState) -> SharedRoomState {
        for booking in &state.bookings {
            self.index_booking(booking);
        }
        let id = state.id();
        let shared = Arc::new(RwLock::new(state));
        self.rooms.insert(id, shared.clone());
        shared
    }

    /// Drop the room from the map. The caller unindexes its bookings while
    /// holding the room's write lock.
    pub fn delete(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.remove(id).map(|(_, state)| state)
    }

    /// Snapshot of every room handle, ordered by id.
    pub fn all(&self) -> Vec<SharedRoomState> {
        let mut entries: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, state)| state).collect()
    }

    // ── Booking indexes ──────────────────────────────────────

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_to_room.insert(booking.id, booking.room_id);
        self.codes
            .insert(booking.confirmation_code.clone(), booking.id);
    }

    fn unindex_booking(&self, booking: &Booking) {
        self.booking_to_room.remove(&booking.id);
        self.codes
            .remove_if(&booking.confirmation_code, |_, id| *id == booking.id);
    }

    /// Claim `code` for `booking_id`. False if another booking holds it.
    pub fn reserve_code(&self, code: &str, booking_id: Ulid) -> bool {
        match self.codes.entry(code.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
                true
            }
        }
    }

    /// Undo a `reserve_code` whose booking never made it to the log.
    pub fn release_code(&self, code: &str, booking_id: Ulid) {
        self.codes.remove_if(code, |_, id| *id == booking_id);
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn find_by_room(&self, room_id: &Ulid) -> Vec<Booking> {
        match self.get(room_id) {
            Some(state) => state.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    pub async fn find_distinct_types(&self) -> BTreeSet<String> {
        let mut types = BTreeSet::new();
        for state in self.all() {
            types.insert(state.read().await.room.room_type.clone());
        }
        types
    }

    pub async fn find_by_confirmation_code(&self, code: &str) -> Option<Booking> {
        let booking_id = self.codes.get(code).map(|e| *e.value())?;
        let room_id = self.room_for_booking(&booking_id)?;
        let state = self.get(&room_id)?;
        let guard = state.read().await;
        guard.bookings.iter().find(|b| b.id == booking_id).cloned()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a room-scoped event to a room the caller holds write-locked.
    pub fn apply_event(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomUpdated { room } => {
                rs.room = room.clone();
            }
            Event::BookingConfirmed { booking } => {
                self.index_booking(booking);
                rs.insert_booking(booking.clone());
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(booking) = rs.remove_booking(*id) {
                    self.unindex_booking(&booking);
                }
            }
            Event::RoomDeleted { .. } => {
                for booking in rs.bookings.drain(..) {
                    self.booking_to_room.remove(&booking.id);
                    self.codes
                        .remove_if(&booking.confirmation_code, |_, id| *id == booking.id);
                }
            }
            // Creation happens at the map level via `save`.
            Event::RoomCreated { .. } => {}
        }
    }
}
