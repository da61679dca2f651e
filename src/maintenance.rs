//! Maintenance (spec §4.J): a periodic long-lived task applying retention,
//! VACUUM past a size threshold, FTS rebuilds, and dismissal decay.

use crate::config::EngineConfig;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(store: Arc<Store>, cfg: Arc<EngineConfig>) {
    let interval = Duration::from_millis(cfg.maintenance_interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = tick(&store, &cfg).await {
            crate::logging::warn(&format!("maintenance tick failed: {e}"));
        }
    }
}

async fn tick(store: &Arc<Store>, cfg: &Arc<EngineConfig>) -> anyhow::Result<()> {
    let now_ms = crate::util::now_ms();
    let cutoff = now_ms - (cfg.retention_days as i64) * 24 * 3600 * 1000;

    let deleted = store.prune(cutoff, cfg.retention_max_events).await?;
    if deleted > 0 {
        crate::logging::info(&format!("maintenance: pruned {deleted} events"));
    }

    if let Ok(meta) = std::fs::metadata(crate::models::db_path()) {
        let size_mb = meta.len() / (1024 * 1024);
        if size_mb > cfg.maintenance_vacuum_threshold_mb {
            crate::logging::info(&format!("maintenance: db at {size_mb}MB, running VACUUM"));
            store.vacuum().await?;
        }
    }

    let decay_horizon = now_ms - (cfg.dismissal_decay_half_life_hours * 3_600_000.0) as i64;
    let decayed = store.decay_dismissals(decay_horizon, 0.5).await?;
    if decayed > 0 {
        crate::logging::debug(&format!("maintenance: decayed {decayed} dismissal counters"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_runs_without_error_on_empty_db() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("state.db"), 1000).await.unwrap());
        let cfg = Arc::new(EngineConfig::default());
        std::env::set_var("CLAI_HOME", dir.path());
        tick(&store, &cfg).await.unwrap();
        std::env::remove_var("CLAI_HOME");
    }
}
