//! OpenTelemetry tracer provider setup and span helpers.

use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::{SpanRef, TraceContextExt};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Config as SdkTraceConfig, Sampler, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use tonic::transport::ClientTlsConfig;

use crate::config::{TraceConfig, TraceExporter};
use crate::error::InitError;
use crate::provider::ShutdownFn;

/// W3C trace context plus W3C baggage.
pub fn default_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Build the tracer provider described by `cfg`.
///
/// Disabled tracing gets a provider whose spans are never sampled, so
/// instrumentation keeps working without recording anything.
///
/// # Errors
///
/// Returns an error if the OTLP exporter cannot be created.
pub fn setup_tracing(
    cfg: &TraceConfig,
    resource: &Resource,
) -> Result<(TracerProvider, ShutdownFn), InitError> {
    if !cfg.enabled {
        let provider = TracerProvider::builder()
            .with_config(sdk_config(Sampler::AlwaysOff, resource))
            .build();
        return Ok((provider, ShutdownFn::noop()));
    }

    let mut builder =
        TracerProvider::builder().with_config(sdk_config(sampler_for(cfg.sample_ratio), resource));

    match cfg.exporter {
        TraceExporter::OtlpGrpc => {
            let endpoint = otlp_endpoint(&cfg.endpoint, cfg.otlp_insecure);
            tracing::info!(endpoint = %endpoint, "Initializing OTLP gRPC trace exporter");

            let mut exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);
            if cfg.otlp_insecure {
                tracing::warn!("OTLP trace exporter is using an insecure gRPC connection");
            } else {
                exporter = exporter.with_tls_config(ClientTlsConfig::new().with_webpki_roots());
            }

            builder = builder.with_batch_exporter(exporter.build_span_exporter()?, runtime::Tokio);
        }
        TraceExporter::None => {
            tracing::info!("Initializing no-op trace exporter");
        }
    }

    let provider = builder.build();

    // Libraries that only know the global API join the same pipeline.
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(default_propagator());

    let handle = provider.clone();
    let shutdown = ShutdownFn::new(move || handle.shutdown().map_err(anyhow::Error::from));
    Ok((provider, shutdown))
}

fn sdk_config(sampler: Sampler, resource: &Resource) -> SdkTraceConfig {
    SdkTraceConfig::default()
        .with_sampler(sampler)
        .with_resource(resource.clone())
}

/// Sampler for a configured ratio: `>= 1` always, `<= 0` or NaN never,
/// anything between samples by trace id.
pub fn sampler_for(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio > 0.0 {
        Sampler::TraceIdRatioBased(ratio)
    } else {
        Sampler::AlwaysOff
    }
}

/// Prefix `endpoint` with a scheme unless it already has one.
pub fn otlp_endpoint(endpoint: &str, insecure: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

/// Hex trace id of the span in `cx`, if it carries a valid one.
pub fn trace_id(cx: &Context) -> Option<String> {
    let span_context = cx.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Hex span id of the span in `cx`, if it carries a valid one.
pub fn span_id(cx: &Context) -> Option<String> {
    let span_context = cx.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.span_id().to_string())
}

/// Add an `exception` event to `span`.
pub(crate) fn record_exception(span: &SpanRef<'_>, message: &str, stacktrace: Option<&str>) {
    let mut attributes = vec![KeyValue::new("exception.message", message.to_string())];
    if let Some(stack) = stacktrace {
        attributes.push(KeyValue::new("exception.stacktrace", stack.to_string()));
    }
    span.add_event("exception", attributes);
}
