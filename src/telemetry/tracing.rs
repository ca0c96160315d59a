use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider},
    Resource,
};
use tracing::info;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::TelemetryConfig;

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name
    pub service_name: String,

    /// Log level or filter directive
    pub log_level: String,

    /// JSON log format
    pub json_logs: bool,

    /// OTLP endpoint (if set, enables OTEL export)
    pub otlp_endpoint: Option<String>,

    /// Sample rate (0.0 - 1.0)
    pub sample_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "eventgate".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
            sample_rate: 1.0,
        }
    }
}

impl From<&TelemetryConfig> for TracingConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            log_level: config.log_level.clone(),
            json_logs: config.json_logs,
            otlp_endpoint: config.otlp_endpoint.clone(),
            sample_rate: config.trace_sample_rate,
            ..Default::default()
        }
    }
}

/// Initialize tracing with optional OTEL export. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level: {}", config.log_level))?;

    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(OpenTelemetryLayer::new(init_otlp_tracer(config, endpoint)?)),
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(otel_layer);

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true);
        subscriber.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer().with_target(true).with_thread_names(true);
        subscriber.with(fmt_layer).try_init()?;
    }

    info!(
        service = %config.service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        otlp = config.otlp_endpoint.is_some(),
        "tracing initialized"
    );

    Ok(())
}

fn sampler(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

/// Initialize OTLP tracer and install its provider globally
fn init_otlp_tracer(config: &TracingConfig, endpoint: &str) -> Result<Tracer> {
    let resource = Resource::new([
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("failed to build OTLP exporter for {endpoint}"))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler(config.sample_rate))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("eventgate");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracer)
}

/// Shutdown tracing (flush pending spans)
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    info!("tracing shutdown complete");
}
