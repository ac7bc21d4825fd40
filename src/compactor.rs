use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::WalStore;

const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// One maintenance pass: compact the log once `threshold` appends have
/// piled up, then drop lock entries no task is holding.
pub async fn compact_once(store: &WalStore, engine: &Engine, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    let compacted = if appends >= threshold {
        match store.compact().await {
            Ok(()) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
                info!(appends, allocations = store.allocation_count(), "wal compacted");
                true
            }
            Err(e) => {
                warn!("wal compaction failed: {e}");
                false
            }
        }
    } else {
        false
    };
    let pruned = engine.locks().prune_idle();
    if pruned > 0 {
        debug!(pruned, "idle employee locks pruned");
    }
    compacted
}

/// Background task that keeps a tenant's WAL short.
pub async fn run_compactor(store: Arc<WalStore>, engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        compact_once(&store, &engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConflictPolicy;
    use crate::model::*;
    use crate::store::AllocationStore;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allocd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store.clone());

        let emp = Ulid::new();
        let proj = Ulid::new();
        engine.register_employee(emp, "Ada".into()).await.unwrap();
        engine.register_project(proj, "Apollo".into()).await.unwrap();
        let a = engine
            .allocate(
                NewAllocation {
                    employee_id: emp,
                    project_id: proj,
                    phase_id: None,
                    span: Span::new(0, 100),
                },
                ConflictPolicy::Reject,
            )
            .await
            .unwrap();
        for end in [90, 80, 70] {
            engine
                .reallocate(a.id, 0, end, None, ConflictPolicy::Reject)
                .await
                .unwrap();
        }

        assert!(!compact_once(&store, &engine, 100).await);
        assert!(compact_once(&store, &engine, 3).await);
        assert_eq!(store.appends_since_compact().await, 0);

        // employee + project + one allocation at its latest span
        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 3);
        drop(engine);
        drop(store);

        let reopened = WalStore::open(&path).unwrap();
        let allocations = reopened.get_employee_allocations(emp).await.unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].span, Span::new(0, 70));
    }

    #[tokio::test]
    async fn prunes_idle_locks() {
        let path = test_wal_path("prune.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store.clone());
        drop(engine.locks().lock(Ulid::new()).await);
        assert_eq!(engine.locks().len(), 1);
        compact_once(&store, &engine, u64::MAX).await;
        assert!(engine.locks().is_empty());
    }
}
