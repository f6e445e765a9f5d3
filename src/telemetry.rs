//! Log setup: a `tracing-subscriber` fmt layer on stderr, plus OTLP export of
//! traces and logs when built with `otel` and `OTEL_EXPORTER_OTLP_ENDPOINT` is
//! set.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const ENV_LOG_FORMAT: &str = "RUNNERS_LAUNCHER_LOG_FORMAT";

#[cfg(feature = "otel")]
const SERVICE_NAME: &str = "runner-launcher";

/// Keeps exporters alive; flushes them on drop.
#[must_use = "dropping the guard flushes and stops telemetry export"]
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

/// `RUST_LOG` wins over `level` when set.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn wants_json() -> bool {
    std::env::var(ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. A second call leaves the first in place.
pub fn init(level: &str) -> TelemetryGuard {
    let (plain, json) = if wants_json() {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        (None, Some(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        (Some(layer), None)
    };

    let registry = tracing_subscriber::registry()
        .with(filter(level))
        .with(plain)
        .with(json);

    #[cfg(feature = "otel")]
    let (registry, providers) = {
        use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
        use tracing_subscriber::Layer;

        let providers = otel::Providers::from_env();
        let traces = providers
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer()));
        let logs = providers.as_ref().map(|p| {
            OpenTelemetryTracingBridge::new(p.logger()).with_filter(otel::exporter_filter())
        });
        (registry.with(traces).with(logs), providers)
    };

    let _ = registry.try_init();
    TelemetryGuard {
        #[cfg(feature = "otel")]
        providers,
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing::Metadata;
    use tracing_subscriber::filter::{FilterFn, filter_fn};

    use super::SERVICE_NAME;

    const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

    /// Targets whose events come from the exporter itself; forwarding them
    /// back into the log exporter would loop.
    const EXPORTER_TARGETS: [&str; 5] = ["opentelemetry", "reqwest", "hyper", "h2", "ureq"];

    /// Drops events emitted by the exporter's own HTTP stack.
    pub fn exporter_filter() -> FilterFn<impl Fn(&Metadata<'_>) -> bool> {
        filter_fn(|meta| {
            !EXPORTER_TARGETS
                .iter()
                .any(|target| meta.target().starts_with(target))
        })
    }

    pub struct Providers {
        tracer: SdkTracerProvider,
        logger: SdkLoggerProvider,
    }

    impl Providers {
        pub fn from_env() -> Option<Self> {
            if std::env::var_os(ENDPOINT_VAR).is_none_or(|v| v.is_empty()) {
                return None;
            }
            match Self::build() {
                Ok(providers) => Some(providers),
                Err(e) => {
                    eprintln!("warning: failed to set up OTLP export: {e:#}");
                    None
                }
            }
        }

        fn build() -> anyhow::Result<Self> {
            let resource = Resource::builder().with_service_name(SERVICE_NAME).build();

            let spans = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .build()?;
            let tracer = SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build();

            let logs = opentelemetry_otlp::LogExporter::builder()
                .with_http()
                .build()?;
            let logger = SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build();

            Ok(Self { tracer, logger })
        }

        pub fn tracer(&self) -> opentelemetry_sdk::trace::Tracer {
            self.tracer.tracer(SERVICE_NAME)
        }

        pub const fn logger(&self) -> &SdkLoggerProvider {
            &self.logger
        }

        pub fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                eprintln!("warning: failed to flush traces: {e}");
            }
            if let Err(e) = self.logger.shutdown() {
                eprintln!("warning: failed to flush logs: {e}");
            }
        }
    }
}
