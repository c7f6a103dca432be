//! Logging, tracing, and metrics export.
//!
//! `CODEX_LOG` sets the filter (default `info`). Logs go to stderr so that
//! stdout carries only command output. With `telemetry.otlp_endpoint` set,
//! spans and metrics are also exported over OTLP/gRPC.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, TelemetryConfig};

const SERVICE_NAME: &str = "codex";
const FILTER_ENV: &str = "CODEX_LOG";

/// Installed exporters; flush them with [`Telemetry::shutdown`].
pub struct Telemetry {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

/// Installs the global subscriber and, when configured, OTLP exporters.
/// Must be called from within the Tokio runtime.
pub fn init(config: &TelemetryConfig) -> Result<Telemetry> {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let resource = Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)]);
    let mut telemetry = Telemetry {
        tracer_provider: None,
        meter_provider: None,
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let spans = SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .context("building OTLP span exporter")?;
            let tracer_provider = TracerProvider::builder()
                .with_batch_exporter(spans, runtime::Tokio)
                .with_resource(resource.clone())
                .build();
            let tracer = tracer_provider.tracer(SERVICE_NAME);
            telemetry.tracer_provider = Some(tracer_provider);

            let metrics = MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .context("building OTLP metric exporter")?;
            let reader = PeriodicReader::builder(metrics, runtime::Tokio).build();
            let meter_provider = SdkMeterProvider::builder()
                .with_reader(reader)
                .with_resource(resource)
                .build();
            opentelemetry::global::set_meter_provider(meter_provider.clone());
            telemetry.meter_provider = Some(meter_provider);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "OTLP export enabled");
    }
    Ok(telemetry)
}

impl Telemetry {
    /// Flushes pending spans and metrics.
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "Span exporter shutdown failed");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "Metric exporter shutdown failed");
            }
        }
    }
}
