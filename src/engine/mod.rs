mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{is_free, is_free_from, matches_type};
pub use error::EngineError;
pub use store::{InMemoryStore, SharedRoomState};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use mockable::{Clock, DefaultClock};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::photo::{DetachedPhotoHost, PhotoHost};
use crate::wal::Wal;

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first queued append, drains whatever else is
/// already waiting, writes the batch, and fsyncs once for all of it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![first];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(control) => {
                    // Controls see every append queued before them.
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes do not leak
    // into the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Room inventory, bookings, and the admission path in front of them.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: SharedClock,
    pub(super) photos: Arc<dyn PhotoHost>,
    /// Shared by every mutation for its whole log-and-apply; compaction takes
    /// it exclusively so the snapshot it writes matches the log it replaces.
    pub(super) log_gate: RwLock<()>,
    /// Serializes room creation so the room cap is checked against a count
    /// no concurrent add can change.
    pub(super) room_admission: Mutex<()>,
    pub(super) max_rooms: usize,
}

/// Fold the log into per-room state. Events for unknown rooms are skipped.
fn rebuild(events: Vec<Event>) -> HashMap<Ulid, RoomState> {
    let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
    for event in events {
        match event {
            Event::RoomCreated { room } => {
                rooms.insert(room.id, RoomState::new(room));
            }
            Event::RoomUpdated { room } => {
                if let Some(rs) = rooms.get_mut(&room.id) {
                    rs.room = room;
                }
            }
            Event::RoomDeleted { id } => {
                rooms.remove(&id);
            }
            Event::BookingConfirmed { booking } => {
                if let Some(rs) = rooms.get_mut(&booking.room_id) {
                    rs.insert_booking(booking);
                }
            }
            Event::BookingCancelled { id, room_id } => {
                if let Some(rs) = rooms.get_mut(&room_id) {
                    rs.remove_booking(id);
                }
            }
        }
    }
    rooms
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        clock: SharedClock,
        photos: Arc<dyn PhotoHost>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let replayed = events.len();
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for (_, rs) in rebuild(events) {
            store.save(rs);
        }
        tracing::info!(
            "replayed {replayed} events from {}: {} rooms",
            wal_path.display(),
            store.room_count()
        );

        Ok(Self {
            store,
            wal_tx,
            clock,
            photos,
            log_gate: RwLock::new(()),
            room_admission: Mutex::new(()),
            max_rooms: crate::limits::MAX_ROOMS,
        })
    }

    /// Engine on the system clock with no asset host attached.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::new(wal_path, Arc::new(DefaultClock), Arc::new(DetachedPhotoHost))
    }

    #[cfg(test)]
    pub(crate) fn with_room_cap(mut self, max_rooms: usize) -> Self {
        self.max_rooms = max_rooms;
        self
    }

    /// Today's calendar date (UTC) per the engine clock.
    pub fn today(&self) -> Date {
        self.clock.utc().date_naive()
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    async fn wal_control<T>(
        &self,
        control: WalControl,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(WalCommand::Control(control))
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))
    }

    /// Make `event` durable, then apply it to the locked room.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(rs, event);
        Ok(())
    }

    /// Resolve a room and take its write lock.
    pub(super) async fn room_write(
        &self,
        room_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .store
            .get(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.write_owned().await;
        // A deletion that held the lock before us has already unmapped the room.
        if !self.store.contains(room_id) {
            return Err(EngineError::NotFound(*room_id));
        }
        Ok(guard)
    }
}
