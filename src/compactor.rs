use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::Store;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once at least `threshold` appends have piled up. Returns whether it ran.
pub async fn compact_if_due(store: &Store, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends ({} cases)", store.case_count());
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically rewrites the WAL.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("orsched_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Store::new(path.clone(), default_rooms(), Arc::new(NotifyHub::new())).unwrap();

        for i in 0..5 {
            store.add_notification(&format!("note {i}")).await.unwrap();
        }
        assert!(!compact_if_due(&store, 10).await);
        assert_eq!(store.wal_appends_since_compact().await, 5);

        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
        drop(store);

        let reopened = Store::new(path, default_rooms(), Arc::new(NotifyHub::new())).unwrap();
        let notes = reopened.list_notifications(10).await;
        assert_eq!(notes.len(), 5);
        assert_eq!(notes[0].message, "note 4");
    }
}
