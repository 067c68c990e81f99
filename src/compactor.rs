use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites a tenant's WAL once `threshold` appends have
/// piled up since the last compaction. Exits when the engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns true when the log was rewritten.
pub async fn compact_if_needed(engine: &Arc<Engine>, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "error")
                .increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::FixedOffset;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn room() -> NewResource {
        NewResource {
            id: Ulid::new(),
            name: "Room".into(),
            kind: ResourceKind::Room,
            active: true,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Arc::new(Engine::new(path, FixedOffset::east_opt(0).unwrap()).unwrap());

        engine.create_resource(room()).await.unwrap();
        assert!(!compact_if_needed(&engine, 3).await);

        engine.create_resource(room()).await.unwrap();
        engine.create_resource(room()).await.unwrap();
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn stops_when_engine_dropped() {
        let path = test_wal_path("dropped.wal");
        let engine = Arc::new(Engine::new(path, FixedOffset::east_opt(0).unwrap()).unwrap());
        let task = tokio::spawn(run_compactor(Arc::downgrade(&engine), 10));
        drop(engine);
        tokio::time::timeout(CHECK_INTERVAL * 2, task)
            .await
            .expect("compactor should exit")
            .unwrap();
    }
}
