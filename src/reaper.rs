use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::model::Ms;
use crate::offers::OfferBlocker;
use crate::store::{RecordStore, Store, now_ms};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that periodically releases expired offer families.
/// Timers do not survive a restart; this catches whatever they missed.
pub async fn run_reaper(blocker: Arc<OfferBlocker>, store: Arc<dyn RecordStore>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        sweep_expired(&blocker, store.as_ref(), now_ms()).await;
    }
}

/// Expire every family overdue at `now`. Returns the number of appointments removed.
pub async fn sweep_expired(blocker: &OfferBlocker, store: &dyn RecordStore, now: Ms) -> usize {
    let families = match store.expired_offer_families(now).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("reaper could not list expired offers: {e}");
            return 0;
        }
    };
    let mut removed = 0;
    for family in families {
        match blocker.expire_family(&family).await {
            Ok(n) => {
                removed += n;
                info!("reaped expired offer family {family}");
            }
            // May already have been resolved concurrently
            Err(e) => tracing::debug!("reaper skip {family}: {e}"),
        }
    }
    removed
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
