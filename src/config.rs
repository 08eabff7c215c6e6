use std::env;
use std::path::PathBuf;

/// Runtime configuration. Every field has a code default; environment
/// variables override.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Identifier of the task queue adapter.
    pub tasks_queue_url: String,
    /// Identifier of the result queue adapter.
    pub results_queue_url: String,
    /// Identifier of the downstream enrichment collaborator.
    pub enricher_function: String,
    /// Cap on due schedules handled per scheduler tick.
    pub max_ips_per_tick: usize,
    /// Scan workers spawned by the `run` command.
    pub workers: usize,
    /// Optional JSON state file shared across CLI invocations.
    pub state_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("TASKS_QUEUE_URL") {
            cfg.tasks_queue_url = v;
        }
        if let Ok(v) = env::var("RESULTS_QUEUE_URL") {
            cfg.results_queue_url = v;
        }
        if let Ok(v) = env::var("ENRICHER_FUNCTION") {
            cfg.enricher_function = v;
        }
        if let Ok(v) = env::var("SWEEP_MAX_IPS") {
            cfg.max_ips_per_tick = v.parse().unwrap_or(cfg.max_ips_per_tick);
        }
        if let Ok(v) = env::var("SWEEP_WORKERS") {
            cfg.workers = v.parse().unwrap_or(cfg.workers);
        }
        if let Ok(v) = env::var("SWEEP_STATE_FILE") {
            cfg.state_file = Some(PathBuf::from(v));
        }

        log::debug!(
            "[config] loaded: tasks_queue={} results_queue={} enricher={} max_ips={} workers={}",
            cfg.tasks_queue_url,
            cfg.results_queue_url,
            cfg.enricher_function,
            cfg.max_ips_per_tick,
            cfg.workers
        );
        cfg
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tasks_queue_url: "memory://tasks".to_string(),
            results_queue_url: "memory://results".to_string(),
            enricher_function: "sweep-enricher".to_string(),
            max_ips_per_tick: 100,
            workers: 2,
            state_file: None,
        }
    }
}
