use std::sync::Arc;

use common::config::Settings;
use common::db::PgPoolManager;
use common::scan::PhishingDetector;
use metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PgPoolManager>,
    pub detector: Arc<dyn PhishingDetector>,
    pub config: Arc<Settings>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Create a new AppState instance
    pub fn new(
        pool: Arc<PgPoolManager>,
        detector: Arc<dyn PhishingDetector>,
        config: Settings,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            pool,
            detector,
            config: Arc::new(config),
            metrics,
        }
    }

    /// Seconds advertised in `Retry-After` when the database is unreachable
    pub fn retry_after_seconds(&self) -> u64 {
        self.config.server.retry_after_seconds
    }
}
