//! OpenTelemetry initialization
//!
//! Spans are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! Attributes that carry pod addresses are redacted before export.

use std::env;

use opentelemetry::trace::TraceResult;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config, Sampler, SpanProcessor};
use tracing_subscriber::{registry::LookupSpan, Layer};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "vault-operator";
const REDACTED: &str = "[REDACTED]";

/// Attribute keys that may hold a pod IP or a URL built from one
const REDACTED_KEYS: &[&str] = &[
    "pod_ip",
    "net.peer.ip",
    "net.peer.name",
    "server.address",
    "http.url",
    "url.full",
];

/// Span processor that redacts address attributes before handing spans on
#[derive(Debug)]
struct ScrubbingProcessor {
    inner: std::sync::Mutex<Box<dyn SpanProcessor + Send + Sync>>,
}

impl ScrubbingProcessor {
    fn new(inner: Box<dyn SpanProcessor + Send + Sync>) -> Self {
        ScrubbingProcessor {
            inner: std::sync::Mutex::new(inner),
        }
    }

    fn scrub_attributes(&self, attributes: &mut [KeyValue]) {
        for kv in attributes.iter_mut() {
            if REDACTED_KEYS.contains(&kv.key.as_str()) {
                kv.value = opentelemetry::Value::String(REDACTED.into());
            }
        }
    }
}

impl SpanProcessor for ScrubbingProcessor {
    fn on_start(&self, span: &mut opentelemetry_sdk::trace::Span, cx: &opentelemetry::Context) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.on_start(span, cx);
        }
    }

    fn on_end(&self, mut span: SpanData) {
        self.scrub_attributes(&mut span.attributes);
        if let Ok(mut inner) = self.inner.lock() {
            inner.on_end(span);
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        match self.inner.lock() {
            Ok(mut inner) => inner.force_flush(),
            Err(_) => Ok(()),
        }
    }

    fn shutdown(&mut self) -> TraceResult<()> {
        match self.inner.lock() {
            Ok(mut inner) => inner.shutdown(),
            Err(_) => Ok(()),
        }
    }
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

/// Build the OTLP tracing layer and install the global tracer provider
pub fn init_telemetry<S>(_subscriber: &S, sample_ratio: f64) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&otlp_endpoint)
        .build_span_exporter()
        .map_err(|e| Error::ConfigError(format!("OTLP exporter for {otlp_endpoint}: {e}")))?;

    let batch_processor =
        opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter, runtime::Tokio).build();

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_config(
            Config::default()
                .with_resource(resource)
                .with_sampler(sampler(sample_ratio)),
        )
        .with_span_processor(ScrubbingProcessor::new(Box::new(batch_processor)))
        .build();

    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

/// Flush and shut down the global tracer provider
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::trace::Span;

    #[derive(Debug)]
    struct NoopProcessor;

    impl SpanProcessor for NoopProcessor {
        fn on_start(&self, _span: &mut Span, _cx: &opentelemetry::Context) {}
        fn on_end(&self, _span: SpanData) {}
        fn force_flush(&self) -> TraceResult<()> {
            Ok(())
        }
        fn shutdown(&mut self) -> TraceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scrubbing_redacts_pod_addresses() {
        let processor = ScrubbingProcessor::new(Box::new(NoopProcessor));
        let mut attributes = vec![
            KeyValue::new("pod_ip", "10.1.2.3"),
            KeyValue::new("name", "example"),
            KeyValue::new("url.full", "https://10-1-2-3.vault.pod:8200/v1/sys/health"),
        ];

        processor.scrub_attributes(&mut attributes);

        assert_eq!(attributes[0].value, opentelemetry::Value::String(REDACTED.into()));
        assert_eq!(attributes[1].value, opentelemetry::Value::String("example".into()));
        assert_eq!(attributes[2].value, opentelemetry::Value::String(REDACTED.into()));
    }

    #[test]
    fn test_sampler_bounds() {
        assert!(matches!(sampler(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler(0.25), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }
}
