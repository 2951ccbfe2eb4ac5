use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "rover-relay";

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Export spans to stdout through OpenTelemetry.
    pub otel_stdout: bool,
    /// Serve Prometheus metrics here; without it metrics are recorded but
    /// not exposed.
    pub metrics_addr: Option<SocketAddr>,
}

/// Logging, tracing and metrics for the lifetime of the process. Dropping it
/// flushes the span exporter.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Must run inside a Tokio runtime when `metrics_addr` is set.
    pub fn init(options: &TelemetryOptions) -> Result<Self> {
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let mut tracer_provider = None;

        if options.otel_stdout {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build();
            let tracer = provider.tracer(SERVICE_NAME);

            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            tracer_provider = Some(provider);
        } else {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
        }

        match options.metrics_addr {
            Some(addr) => {
                PrometheusBuilder::new()
                    .with_http_listener(addr)
                    .install()
                    .context("failed to install Prometheus exporter")?;
                info!(metrics_addr = %addr, "serving Prometheus metrics");
            }
            None => {
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install Prometheus metrics recorder")?;
            }
        }

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled");
        }

        Ok(Self { tracer_provider })
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(
                    error = %err,
                    "failed to shutdown OpenTelemetry tracer provider"
                );
            }
        }
    }
}
