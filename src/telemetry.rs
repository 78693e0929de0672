//! Logging and optional OTLP export.
//!
//! Filter comes from `TANDEM_LOG`, then `RUST_LOG`, defaulting to `info`.
//! `TANDEM_LOG_FORMAT=json` switches stderr output to JSON lines. With the
//! `otel` feature, setting `OTEL_EXPORTER_OTLP_ENDPOINT` also exports spans
//! and log records over OTLP/HTTP.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const SERVICE_NAME: &str = "tandem";

/// Flushes exporters when dropped. Hold it for the life of `main`.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<otel::Providers>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.providers.take() {
            providers.shutdown();
        }
    }
}

fn filter() -> EnvFilter {
    std::env::var("TANDEM_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn json_output() -> bool {
    std::env::var("TANDEM_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init() -> TelemetryGuard {
    let json = json_output();
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    #[cfg(feature = "otel")]
    {
        let providers = otel::Providers::from_env();
        let trace_layer = providers.as_ref().map(otel::Providers::trace_layer);
        let log_layer = providers.as_ref().map(otel::Providers::log_layer);
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(text_layer)
            .with(json_layer)
            .with(trace_layer)
            .with(log_layer)
            .try_init();
        TelemetryGuard { providers }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(text_layer)
            .with(json_layer)
            .try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_otlp::{LogExporter, SpanExporter, WithExportConfig};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing::Subscriber;
    use tracing_subscriber::Layer;
    use tracing_subscriber::registry::LookupSpan;

    use super::SERVICE_NAME;

    pub struct Providers {
        tracer: SdkTracerProvider,
        logger: SdkLoggerProvider,
    }

    impl Providers {
        /// Build exporters when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
        /// Export setup failures are reported and otherwise ignored.
        pub fn from_env() -> Option<Self> {
            let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
            if endpoint.trim().is_empty() {
                return None;
            }
            match Self::build(&endpoint) {
                Ok(p) => Some(p),
                Err(e) => {
                    eprintln!("warning: OTLP export disabled: {e}");
                    None
                }
            }
        }

        fn build(endpoint: &str) -> anyhow::Result<Self> {
            let base = endpoint.trim_end_matches('/');
            let resource = Resource::builder().with_service_name(SERVICE_NAME).build();

            let spans = SpanExporter::builder()
                .with_http()
                .with_endpoint(format!("{base}/v1/traces"))
                .build()?;
            let tracer = SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build();

            let logs = LogExporter::builder()
                .with_http()
                .with_endpoint(format!("{base}/v1/logs"))
                .build()?;
            let logger = SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build();

            Ok(Self { tracer, logger })
        }

        pub fn trace_layer<S>(&self) -> impl Layer<S> + use<S>
        where
            S: Subscriber + for<'span> LookupSpan<'span>,
        {
            tracing_opentelemetry::layer().with_tracer(self.tracer.tracer(SERVICE_NAME))
        }

        pub fn log_layer<S>(&self) -> impl Layer<S> + use<S>
        where
            S: Subscriber + for<'span> LookupSpan<'span>,
        {
            OpenTelemetryTracingBridge::new(&self.logger)
        }

        pub fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                eprintln!("warning: flushing spans: {e}");
            }
            if let Err(e) = self.logger.shutdown() {
                eprintln!("warning: flushing logs: {e}");
            }
        }
    }
}
