use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::WalStore;

/// Compact once this many appends have accumulated, checked every `every`.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::AppointmentStore;
    use crate::testing::*;
    use crate::model::Span;

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = wal_path("chairbook_test_compactor", "threshold.wal");
        let (store, shop, provider) = seeded_store(path, "UTC").await;

        assert!(!compact_if_due(&store, 10).await);
        assert_eq!(store.wal_appends_since_compact().await, 2);

        for i in 0..8 {
            let a = appointment(shop.id, provider.id, i * 3_600_000, 30);
            store
                .insert_if_free(a, Span::new(0, i64::MAX), &admit_all)
                .await
                .unwrap();
        }
        assert!(compact_if_due(&store, 10).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
}
