//! Prometheus metrics for the engine

use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::Registry;

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct EngineMetrics {
    pub uploads: Counter,
    pub searches: Family<Labels, Counter>,
    pub integrity_failures: Counter,
    pub decrypt_failures: Counter,
    pub search_duration: Family<Labels, Histogram>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            uploads: Counter::default(),
            searches: Family::default(),
            integrity_failures: Counter::default(),
            decrypt_failures: Counter::default(),
            search_duration: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
            }),
        }
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("uploads", &self.uploads.get())
            .field("integrity_failures", &self.integrity_failures.get())
            .field("decrypt_failures", &self.decrypt_failures.get())
            .finish_non_exhaustive()
    }
}

impl EngineMetrics {
    /// Create the metrics and register them on `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        metrics.register(registry);
        metrics
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "cdx_uploads",
            "Documents uploaded and indexed",
            self.uploads.clone(),
        );
        registry.register(
            "cdx_searches",
            "Searches served, by mode",
            self.searches.clone(),
        );
        registry.register(
            "cdx_index_integrity_failures",
            "Posting lists whose integrity tag did not verify",
            self.integrity_failures.clone(),
        );
        registry.register(
            "cdx_decrypt_failures",
            "Candidates dropped during verification because decryption failed",
            self.decrypt_failures.clone(),
        );
        registry.register(
            "cdx_search_duration_seconds",
            "Search latency in seconds, by mode",
            self.search_duration.clone(),
        );
    }

    pub fn mode_labels(mode: &str) -> Labels {
        vec![("mode".to_string(), mode.to_string())]
    }

    pub fn record_search(&self, mode: &str, elapsed_secs: f64) {
        let labels = Self::mode_labels(mode);
        self.searches.get_or_create(&labels).inc();
        self.search_duration.get_or_create(&labels).observe(elapsed_secs);
    }
}
