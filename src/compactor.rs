use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

/// Background task: every `period`, rewrite the WAL once at least
/// `threshold` appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// True if a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            info!("compactor: rewrote WAL after {appends} appends");
            true
        }
        Err(e) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            warn!("compactor: compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_room() -> NewRoom {
        NewRoom {
            room_type: "Deluxe".into(),
            price: "99".parse().unwrap(),
            description: None,
            photo_url: "https://photos.example/r.jpg".into(),
        }
    }

    #[tokio::test]
    async fn skips_below_threshold() {
        let engine = Engine::open(test_wal_path("below.wal")).unwrap();
        engine.add_room(new_room()).await.unwrap();
        assert!(!compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn compacts_at_threshold() {
        let path = test_wal_path("at_threshold.wal");
        let engine = Engine::open(path.clone()).unwrap();
        let room = engine.add_room(new_room()).await.unwrap();
        for _ in 0..4 {
            engine
                .update_room(
                    room.id,
                    RoomUpdate {
                        description: Some("renovated".into()),
                        ..RoomUpdate::default()
                    },
                )
                .await
                .unwrap();
        }

        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::open(path).unwrap();
        let detail = reopened.get_room(room.id).await.unwrap();
        assert_eq!(detail.room.description.as_deref(), Some("renovated"));
    }

    #[tokio::test]
    async fn background_task_compacts_on_tick() {
        let engine = Arc::new(Engine::open(test_wal_path("background.wal")).unwrap());
        engine.add_room(new_room()).await.unwrap();
        engine.add_room(new_room()).await.unwrap();

        let task = tokio::spawn(run_compactor(engine.clone(), 2, Duration::from_millis(20)));
        for _ in 0..100 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        task.abort();
    }
}
