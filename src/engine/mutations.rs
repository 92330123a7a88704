use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, generate_confirmation_code, validate_admission, validate_stay};
use super::{Engine, EngineError, WalControl};

fn validate_room_type(room_type: &str) -> Result<(), EngineError> {
    if room_type.trim().is_empty() {
        return Err(EngineError::Validation("room type is required"));
    }
    if room_type.len() > MAX_ROOM_TYPE_LEN {
        return Err(EngineError::LimitExceeded("room type too long"));
    }
    Ok(())
}

fn validate_photo(photo_url: &str) -> Result<(), EngineError> {
    if photo_url.trim().is_empty() {
        return Err(EngineError::Validation("room photo is required"));
    }
    if photo_url.len() > MAX_PHOTO_URL_LEN {
        return Err(EngineError::LimitExceeded("photo reference too long"));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<(), EngineError> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => {
            Err(EngineError::LimitExceeded("description too long"))
        }
        _ => Ok(()),
    }
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn add_room(&self, new: NewRoom) -> Result<RoomInfo, EngineError> {
        validate_room_type(&new.room_type)?;
        validate_photo(&new.photo_url)?;
        validate_description(new.description.as_deref())?;

        let _admission = self.room_admission.lock().await;
        let _gate = self.log_gate.read().await;
        if self.store.room_count() >= self.max_rooms {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let room = Room {
            id: Ulid::new(),
            room_type: new.room_type,
            price: new.price,
            description: new.description,
            photo_url: Some(new.photo_url),
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.store.save(RoomState::new(room.clone()));

        info!("room {} added ({}, {})", room.id, room.room_type, room.price);
        Ok(RoomInfo::from(&room))
    }

    /// Apply the fields present in `update`. A blank room type is ignored.
    /// Replacing the photo releases the previous reference.
    pub async fn update_room(&self, id: Ulid, update: RoomUpdate) -> Result<RoomInfo, EngineError> {
        let room_type = update.room_type.filter(|t| !t.trim().is_empty());
        if let Some(ref t) = room_type {
            validate_room_type(t)?;
        }
        let photo_url = update.photo_url.filter(|p| !p.trim().is_empty());
        if let Some(ref p) = photo_url {
            validate_photo(p)?;
        }
        validate_description(update.description.as_deref())?;

        let gate = self.log_gate.read().await;
        let mut guard = self.room_write(&id).await?;

        let mut room = guard.room.clone();
        if let Some(t) = room_type {
            room.room_type = t;
        }
        if let Some(price) = update.price {
            room.price = price;
        }
        if let Some(description) = update.description {
            room.description = Some(description);
        }
        let replaced_photo = match photo_url {
            Some(p) if room.photo_url.as_deref() != Some(p.as_str()) => {
                room.photo_url.replace(p)
            }
            _ => None,
        };

        let event = Event::RoomUpdated { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        drop(gate);

        if let Some(old) = replaced_photo {
            self.release_photo(&old).await;
        }
        info!("room {id} updated");
        Ok(RoomInfo::from(&room))
    }

    /// Remove the room together with its bookings, then release its photo.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let gate = self.log_gate.read().await;
        let mut guard = self.room_write(&id).await?;

        let event = Event::RoomDeleted { id };
        let dropped_bookings = guard.bookings.len();
        self.persist_and_apply(&mut guard, &event).await?;
        self.store.delete(&id);
        let photo = guard.room.photo_url.take();
        drop(guard);
        drop(gate);

        if let Some(photo) = photo {
            self.release_photo(&photo).await;
        }
        info!("room {id} deleted with {dropped_bookings} bookings");
        Ok(())
    }

    /// The room change is already durable; a host failure only leaks the asset.
    async fn release_photo(&self, photo_url: &str) {
        if let Err(e) = self.photos.release(photo_url).await {
            warn!("failed to release photo {photo_url}: {e}");
            metrics::counter!(observability::PHOTO_RELEASE_FAILURES_TOTAL).increment(1);
        }
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admit a booking for `[check_in, check_out)` on `room_id`.
    ///
    /// The conflict check, the log append and the in-memory insert all run
    /// under the room's write lock, so two overlapping requests for the same
    /// room cannot both pass.
    pub async fn create_booking(
        &self,
        room_id: Ulid,
        check_in: Date,
        check_out: Date,
        guest: String,
    ) -> Result<BookingInfo, EngineError> {
        let stay = validate_stay(check_in, check_out)?;
        let today = self.today();
        validate_admission(&stay, today, &guest)?;

        let _gate = self.log_gate.read().await;
        let mut guard = self.room_write(&room_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }

        if let Err(e) = check_no_conflict(&guard, &stay, None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!("booking refused on room {room_id} for {stay}: {e}");
            return Err(e);
        }

        let id = Ulid::new();
        let confirmation_code = self.reserve_confirmation_code(id)?;
        let booking = Booking {
            id,
            confirmation_code,
            room_id,
            stay,
            guest,
        };
        let event = Event::BookingConfirmed {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.store.release_code(&booking.confirmation_code, id);
            return Err(e);
        }

        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(
            "booking {id} ({}) confirmed on room {room_id} for {stay}",
            booking.confirmation_code
        );
        Ok(BookingInfo::new(&booking, today))
    }

    /// Draw codes until one is free; collisions retry rather than fail.
    fn reserve_confirmation_code(&self, booking_id: Ulid) -> Result<String, EngineError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_confirmation_code(&mut rng);
            if self.store.reserve_code(&code, booking_id) {
                return Ok(code);
            }
            debug!("confirmation code collision on {code}, retrying");
        }
        Err(EngineError::LimitExceeded("no free confirmation code"))
    }

    /// Returns the room the booking belonged to.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let room_id = self
            .store
            .room_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;

        let _gate = self.log_gate.read().await;
        let mut guard = self.room_write(&room_id).await?;
        if !guard.bookings.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::BookingCancelled { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} on room {room_id} cancelled");
        Ok(room_id)
    }

    // ── Log maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.log_gate.write().await;

        let mut events = Vec::new();
        for rs in self.store.all() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingConfirmed {
                booking: b.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_control(WalControl::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        match self
            .wal_control(WalControl::AppendsSinceCompact { response: tx }, rx)
            .await
        {
            Ok(appends) => appends,
            Err(e) => {
                warn!("cannot read WAL append count: {e}");
                0
            }
        }
    }
}
