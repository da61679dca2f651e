//! Every tunable named in the spec, collected in one place with env overrides.
//!
//! The engine never parses `config.yaml` — that belongs to the external CLI/config
//! loader. What lives here are the numeric knobs the core subsystems need at
//! runtime, defaulted the way the spec defaults them and overridable via
//! environment variables for testing and operator tuning, following the
//! teacher's `load_config`/env-override precedence (`src/server/mod.rs::init_session`).

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // §4.A Normalizer
    pub pipeline_max_segments: usize,
    pub alias_expand_max_depth: u8,

    // §4.C Ingest pipeline
    pub ingest_queue_max_events: usize,
    pub ingest_queue_max_bytes: usize,
    pub burst_events_threshold: u32,
    pub burst_window_ms: u64,
    pub burst_quiet_ms: u64,
    pub ingest_sync_wait_ms: u64,

    // §4.D Session tracker
    pub pending_start_ttl: Duration,
    pub session_idle_evict: Duration,

    // §4.E Candidate generator
    pub fallback_window_ms: u64,
    pub failure_recovery_min_count: u64,
    pub candidate_pool_per_source: usize,

    // §4.F Scorer / online learning
    pub feedback_smoothing_k: f64,
    pub signal_weight_min: f64,
    pub signal_weight_max: f64,
    pub online_learning_min_samples: u64,
    pub learning_rate_initial: f64,
    pub learning_rate_decay_const: f64,
    pub learning_rate_floor: f64,
    pub feedback_match_window_ms: u64,
    pub score_half_life_hours: f64,
    pub risk_tag_weights: HashMap<String, f64>,
    pub hook_write_timeout_ms: u64,

    // §4.G Cache
    pub cache_ttl_ms: u64,
    pub cache_memory_budget_mb: u64,

    // §4.H Server
    pub hard_timeout_ms: u64,
    pub idle_timeout_mins: u64,

    // §4.B Store
    pub sqlite_busy_timeout_ms: u64,
    pub search_fallback_scan_limit: usize,

    // §4.J Maintenance
    pub retention_days: u32,
    pub retention_max_events: u64,
    pub maintenance_interval_ms: u64,
    pub maintenance_vacuum_threshold_mb: u64,
    pub dismissal_decay_half_life_hours: f64,

    // §4.I Validator
    pub max_results_default: u32,
    pub max_results_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut risk_tag_weights = HashMap::new();
        risk_tag_weights.insert("destructive_rm".to_string(), 0.6);
        risk_tag_weights.insert("disk_write".to_string(), 0.6);
        risk_tag_weights.insert("fork_bomb".to_string(), 1.0);
        risk_tag_weights.insert("sql_drop".to_string(), 0.5);
        risk_tag_weights.insert("force_vcs".to_string(), 0.3);
        risk_tag_weights.insert("system_path_write".to_string(), 0.5);

        EngineConfig {
            pipeline_max_segments: 8,
            alias_expand_max_depth: 3,

            ingest_queue_max_events: 4096,
            ingest_queue_max_bytes: 16 * 1024 * 1024,
            burst_events_threshold: 50,
            burst_window_ms: 1000,
            burst_quiet_ms: 2000,
            ingest_sync_wait_ms: 5,

            pending_start_ttl: Duration::from_secs(60),
            session_idle_evict: Duration::from_secs(6 * 3600),

            fallback_window_ms: 15 * 60 * 1000,
            failure_recovery_min_count: 2,
            candidate_pool_per_source: 20,

            feedback_smoothing_k: 5.0,
            signal_weight_min: 0.0,
            signal_weight_max: 3.0,
            online_learning_min_samples: 20,
            learning_rate_initial: 0.1,
            learning_rate_decay_const: 100.0,
            learning_rate_floor: 0.002,
            feedback_match_window_ms: 30_000,
            score_half_life_hours: 72.0,
            risk_tag_weights,
            hook_write_timeout_ms: 10,

            cache_ttl_ms: 2000,
            cache_memory_budget_mb: 32,

            hard_timeout_ms: 200,
            idle_timeout_mins: 0,

            sqlite_busy_timeout_ms: 2000,
            search_fallback_scan_limit: 5000,

            retention_days: 180,
            retention_max_events: 200_000,
            maintenance_interval_ms: 6 * 3600 * 1000,
            maintenance_vacuum_threshold_mb: 256,
            dismissal_decay_half_life_hours: 24.0 * 30.0,

            max_results_default: 10,
            max_results_cap: 50,
        }
    }
}

impl EngineConfig {
    /// Overlay environment variable overrides on top of the defaults.
    ///
    /// Only numeric/bool knobs an operator might reasonably need to tune for a
    /// single run (tests, debugging) are overridable; names mirror the field
    /// they set, prefixed `CLAI_TUNE_`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_u64(&mut cfg.ingest_sync_wait_ms, "CLAI_TUNE_INGEST_SYNC_WAIT_MS");
        env_usize(
            &mut cfg.ingest_queue_max_events,
            "CLAI_TUNE_INGEST_QUEUE_MAX_EVENTS",
        );
        env_u64(&mut cfg.cache_ttl_ms, "CLAI_TUNE_CACHE_TTL_MS");
        env_u64(&mut cfg.hard_timeout_ms, "CLAI_TUNE_HARD_TIMEOUT_MS");
        env_u64(
            &mut cfg.sqlite_busy_timeout_ms,
            "CLAI_TUNE_SQLITE_BUSY_TIMEOUT_MS",
        );
        env_u64(&mut cfg.idle_timeout_mins, "CLAI_TUNE_IDLE_TIMEOUT_MINS");
        env_u32(&mut cfg.retention_days, "CLAI_TUNE_RETENTION_DAYS");
        cfg
    }
}

fn env_u64(slot: &mut u64, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse() {
            *slot = n;
        }
    }
}

fn env_u32(slot: &mut u32, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse() {
            *slot = n;
        }
    }
}

fn env_usize(slot: &mut usize, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse() {
            *slot = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_boundaries() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_results_default, 10);
        assert_eq!(cfg.max_results_cap, 50);
        assert_eq!(cfg.ingest_sync_wait_ms, 5);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("CLAI_TUNE_CACHE_TTL_MS", "9999");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.cache_ttl_ms, 9999);
        std::env::remove_var("CLAI_TUNE_CACHE_TTL_MS");
    }
}
