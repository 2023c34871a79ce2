/*!
Observability for the Drafthold engine.

- Structured JSON logging through `tracing-subscriber`
- Prometheus counters and histograms behind the `metrics` feature

The `record_*` functions are always available and compile to no-ops when the
feature is off, so engine code records unconditionally.
*/

use tracing::subscriber::set_global_default;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{DraftError, Result};

/// Default log directive when `RUST_LOG` does not override it
pub const DEFAULT_LOG_DIRECTIVE: &str = "drafthold=info";

#[cfg(feature = "metrics")]
pub use prometheus_metrics::DraftMetrics;

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use crate::{DraftError, Result};
    use once_cell::sync::OnceCell;
    use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

    static METRICS: OnceCell<DraftMetrics> = OnceCell::new();

    /// Metrics collected by the engine
    #[derive(Debug)]
    pub struct DraftMetrics {
        pub saves_total: IntCounter,
        pub save_failures_total: IntCounter,
        pub save_retries_total: IntCounter,
        pub quota_fallbacks_total: IntCounter,
        pub save_latency_seconds: Histogram,
        pub document_size_bytes: Histogram,

        pub backups_created_total: IntCounter,
        pub backups_rotated_total: IntCounter,
        pub restores_skipped_total: IntCounter,
        pub backup_size_bytes: Histogram,

        pub cache_hits_total: IntCounter,
        pub cache_misses_total: IntCounter,

        registry: Registry,
    }

    fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
        let counter = IntCounter::new(name, help)
            .map_err(|e| DraftError::config(format!("Failed to create metric {name}: {e}")))?;
        registry
            .register(Box::new(counter.clone()))
            .map_err(|e| DraftError::config(format!("Failed to register {name}: {e}")))?;
        Ok(counter)
    }

    fn histogram(
        registry: &Registry,
        name: &str,
        help: &str,
        buckets: Vec<f64>,
    ) -> Result<Histogram> {
        let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
            .map_err(|e| DraftError::config(format!("Failed to create metric {name}: {e}")))?;
        registry
            .register(Box::new(histogram.clone()))
            .map_err(|e| DraftError::config(format!("Failed to register {name}: {e}")))?;
        Ok(histogram)
    }

    impl DraftMetrics {
        fn new() -> Result<Self> {
            let registry = Registry::new();
            let size_buckets = prometheus::exponential_buckets(1024.0, 4.0, 8)
                .map_err(|e| DraftError::config(format!("Invalid size buckets: {e}")))?;

            Ok(Self {
                saves_total: counter(&registry, "drafthold_saves_total", "Successful saves")?,
                save_failures_total: counter(
                    &registry,
                    "drafthold_save_failures_total",
                    "Saves that failed after every attempt",
                )?,
                save_retries_total: counter(
                    &registry,
                    "drafthold_save_retries_total",
                    "Primary write retries",
                )?,
                quota_fallbacks_total: counter(
                    &registry,
                    "drafthold_quota_fallbacks_total",
                    "Compression-free fallback writes after a full store",
                )?,
                save_latency_seconds: histogram(
                    &registry,
                    "drafthold_save_latency_seconds",
                    "Duration of save calls in seconds",
                    prometheus::DEFAULT_BUCKETS.to_vec(),
                )?,
                document_size_bytes: histogram(
                    &registry,
                    "drafthold_document_size_bytes",
                    "Serialized document size in bytes",
                    size_buckets.clone(),
                )?,
                backups_created_total: counter(
                    &registry,
                    "drafthold_backups_created_total",
                    "Backups written",
                )?,
                backups_rotated_total: counter(
                    &registry,
                    "drafthold_backups_rotated_total",
                    "Backups deleted by the retention cap",
                )?,
                restores_skipped_total: counter(
                    &registry,
                    "drafthold_restores_skipped_total",
                    "Backups skipped on restore after failing verification",
                )?,
                backup_size_bytes: histogram(
                    &registry,
                    "drafthold_backup_size_bytes",
                    "Stored backup size in bytes",
                    size_buckets,
                )?,
                cache_hits_total: counter(
                    &registry,
                    "drafthold_cache_hits_total",
                    "Export cache hits",
                )?,
                cache_misses_total: counter(
                    &registry,
                    "drafthold_cache_misses_total",
                    "Export cache misses",
                )?,
                registry,
            })
        }

        /// Get or initialize the global metrics instance
        pub fn global() -> Result<&'static DraftMetrics> {
            METRICS.get_or_try_init(Self::new)
        }

        /// Gather metrics in Prometheus text format
        pub fn gather_metrics(&self) -> Result<String> {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder
                .encode(&self.registry.gather(), &mut buffer)
                .map_err(|e| DraftError::config(format!("Failed to encode metrics: {e}")))?;

            String::from_utf8(buffer)
                .map_err(|e| DraftError::config(format!("Metrics are not valid UTF-8: {e}")))
        }
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(record: impl FnOnce(&DraftMetrics)) {
    match DraftMetrics::global() {
        Ok(metrics) => record(metrics),
        Err(e) => tracing::debug!(error = %e, "metrics unavailable"),
    }
}

#[cfg(feature = "metrics")]
mod recorders {
    use super::with_metrics;
    use std::time::Duration;

    pub fn record_save(latency: Duration, document_size: usize) {
        with_metrics(|m| {
            m.saves_total.inc();
            m.save_latency_seconds.observe(latency.as_secs_f64());
            m.document_size_bytes.observe(document_size as f64);
        });
    }

    pub fn record_save_failure() {
        with_metrics(|m| m.save_failures_total.inc());
    }

    pub fn record_retry() {
        with_metrics(|m| m.save_retries_total.inc());
    }

    pub fn record_quota_fallback() {
        with_metrics(|m| m.quota_fallbacks_total.inc());
    }

    pub fn record_backup_created(size: usize) {
        with_metrics(|m| {
            m.backups_created_total.inc();
            m.backup_size_bytes.observe(size as f64);
        });
    }

    pub fn record_backups_rotated(count: usize) {
        with_metrics(|m| m.backups_rotated_total.inc_by(count as u64));
    }

    pub fn record_restore_skipped() {
        with_metrics(|m| m.restores_skipped_total.inc());
    }

    pub fn record_cache_lookup(hit: bool) {
        with_metrics(|m| {
            if hit {
                m.cache_hits_total.inc();
            } else {
                m.cache_misses_total.inc();
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
mod recorders {
    use std::time::Duration;

    pub fn record_save(_latency: Duration, _document_size: usize) {}
    pub fn record_save_failure() {}
    pub fn record_retry() {}
    pub fn record_quota_fallback() {}
    pub fn record_backup_created(_size: usize) {}
    pub fn record_backups_rotated(_count: usize) {}
    pub fn record_restore_skipped() {}
    pub fn record_cache_lookup(_hit: bool) {}
}

pub use recorders::*;

/// Install the global tracing subscriber
///
/// Logs are emitted to stderr as JSON lines. `RUST_LOG` directives are
/// honoured on top of `default_directive`.
///
/// # Errors
/// * `DraftError::Config` - the directive does not parse, or a global
///   subscriber is already installed
pub fn init_observability(default_directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    DraftMetrics::global()?;

    let directive = default_directive
        .parse::<Directive>()
        .map_err(|e| DraftError::config(format!("Invalid log directive '{default_directive}': {e}")))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(false)
        .with_writer(std::io::stderr);

    let subscriber = TracingRegistry::default()
        .with(EnvFilter::from_default_env().add_directive(directive))
        .with(fmt_layer);

    set_global_default(subscriber)
        .map_err(|e| DraftError::config(format!("Failed to set global tracing subscriber: {e}")))?;

    tracing::info!("Drafthold observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_directive() {
        let err = init_observability("drafthold=loudest").unwrap_err();
        assert!(matches!(err, DraftError::Config(_)));
    }

    #[test]
    fn test_recorders_never_panic() {
        record_save(std::time::Duration::from_millis(12), 2048);
        record_save_failure();
        record_retry();
        record_quota_fallback();
        record_backup_created(512);
        record_backups_rotated(2);
        record_restore_skipped();
        record_cache_lookup(true);
        record_cache_lookup(false);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_cache_lookup(true);
        record_backups_rotated(3);

        let text = DraftMetrics::global().unwrap().gather_metrics().unwrap();
        assert!(text.contains("drafthold_cache_hits_total"));
        assert!(text.contains("drafthold_backups_rotated_total"));
    }
}
