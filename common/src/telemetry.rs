// Telemetry module for structured logging, metrics, and tracing

use crate::config::LogFormat;
use crate::db::PoolStatus;
use crate::models::Safety;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "browseshield-api";

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `log_level`. JSON output carries the
/// current span and span list; the pretty format is meant for local runs.
/// When `tracing_endpoint` is set, spans are also exported over OTLP.
pub fn init_logging(
    log_level: &str,
    format: LogFormat,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        log_format = ?format,
        tracing_endpoint = tracing_endpoint,
        "Logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    Ok(tracer_provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus recorder and describe every metric.
///
/// The returned handle renders the exposition text for `GET /metrics`.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_gauge!(
        "db_pool_connections_live",
        "Idle plus checked-out database connections"
    );
    describe_gauge!("db_pool_connections_idle", "Idle database connections");
    describe_gauge!(
        "db_pool_connections_checked_out",
        "Database connections currently held by request handlers"
    );
    describe_counter!(
        "db_pool_acquire_failures_total",
        "Failed connection acquisitions by reason"
    );
    describe_counter!("scan_requests_total", "Completed scans by verdict");
    describe_histogram!(
        "scan_detector_seconds",
        "Time spent in the phishing detector"
    );

    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Publish pool gauges
#[inline]
pub fn record_pool_status(status: &PoolStatus) {
    gauge!("db_pool_connections_live").set(status.live as f64);
    gauge!("db_pool_connections_idle").set(status.idle as f64);
    gauge!("db_pool_connections_checked_out").set(status.checked_out as f64);
}

#[inline]
pub fn record_acquire_failure(reason: &'static str) {
    counter!("db_pool_acquire_failures_total", "reason" => reason).increment(1);
}

#[inline]
pub fn record_scan(safety: Safety, detector_seconds: f64) {
    counter!("scan_requests_total", "safety" => safety.as_str()).increment(1);
    histogram!("scan_detector_seconds").record(detector_seconds);
}
