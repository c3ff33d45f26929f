use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::store::LocalStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// One compactor pass. Returns true if the log was rewritten.
pub async fn compact_if_needed(store: &LocalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            error!("compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::*;
    use crate::store::BookingStore;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hotel_booking_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = LocalStore::open(&path, Arc::new(FixedClock::new(0))).unwrap();

        let room = Room {
            id: Ulid::new(),
            hotel_id: Ulid::new(),
            number: Some("7".into()),
            capacity: 1,
            price_cents: 5_000,
        };
        store.register_room(room.clone()).await.unwrap();
        assert!(!compact_if_needed(&store, 3).await);

        for i in 0..3 {
            let draft = NewBooking {
                user_id: Ulid::new(),
                room_id: room.id,
                span: Span::new(i * DAY_MS, (i + 1) * DAY_MS),
            };
            store.reserve(draft).await.unwrap();
        }
        assert!(compact_if_needed(&store, 3).await);
        assert_eq!(store.appends_since_compact().await, 0);
        assert_eq!(store.find_room(room.id).await.unwrap(), Some(room));
    }
}
