use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically expire lapsed reservations. The sweep itself lives on the
/// engine; this task only decides when it runs.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = engine.sweep().await;
        if report.scanned > 0 {
            debug!(?report, "sweep finished");
        }
    }
}

/// Compact the WAL once enough appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stockhold_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_task_reclaims_lapsed_holds() {
        let config = EngineConfig {
            reservation_ttl_ms: 50,
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            Engine::new(test_wal_path("sweeper_task.wal"), Arc::new(NotifyHub::new()), config)
                .unwrap(),
        );
        let pid = Ulid::new();
        let user = Ulid::new();
        engine.create_product(pid, None, 100, 3).await.unwrap();
        engine.add_to_cart(user, pid, 3).await.unwrap();
        engine.checkout(user).await.unwrap();
        assert_eq!(engine.get_product(pid).await.unwrap().available, 0);

        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(20)));
        let mut reclaimed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.get_product(pid).await.unwrap().available == 3 {
                reclaimed = true;
                break;
            }
        }
        task.abort();
        assert!(reclaimed, "sweeper never released the lapsed hold");
    }

    #[tokio::test]
    async fn compactor_skips_below_threshold() {
        let engine = Arc::new(
            Engine::new(
                test_wal_path("compactor_threshold.wal"),
                Arc::new(NotifyHub::new()),
                EngineConfig::default(),
            )
            .unwrap(),
        );
        engine.create_product(Ulid::new(), None, 1, 1).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        let task = tokio::spawn(run_compactor(engine.clone(), 1_000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }
}
