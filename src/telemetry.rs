//! The telemetry handle passed to everything that records telemetry.
//!
//! A [`Telemetry`] bundles the tracer, the meter, the metric registry, the
//! propagator and the stack trace filters. It is cheap to clone and is
//! handed out by [`crate::Provider::telemetry`] or built directly in tests.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{Config as SdkTraceConfig, Sampler, Tracer, TracerProvider};

use crate::config::DEFAULT_INSTRUMENTATION_SCOPE;
use crate::metrics::registry::MetricRegistry;
use crate::propagation::{HeaderExtractor, HeaderInjector, MetadataExtractor, MetadataInjector};
use crate::trace::default_propagator;

struct Inner {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    tracer: Tracer,
    meter: Meter,
    registry: Arc<MetricRegistry>,
    propagator: TextMapCompositePropagator,
    stack_filters: Vec<String>,
}

/// Handle to the tracer, meter and metric registry.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Build a handle over existing providers.
    ///
    /// # Arguments
    ///
    /// * `tracer_provider` - Source of the tracer
    /// * `meter_provider` - Source of the meter the registry creates instruments on
    /// * `scope` - Instrumentation scope name of the tracer and meter. The
    ///   meter API only takes `'static` names, so each distinct owned scope
    ///   is leaked once per process and reused afterwards.
    /// * `stack_filters` - Frame prefixes dropped from recovered panic stacks
    pub fn new(
        tracer_provider: TracerProvider,
        meter_provider: SdkMeterProvider,
        scope: impl Into<Cow<'static, str>>,
        stack_filters: Vec<String>,
    ) -> Self {
        crate::panic::install_hook();

        let scope = static_scope(scope.into());
        let tracer = tracer_provider.tracer(scope);
        let meter = meter_provider.meter(scope);
        let registry = Arc::new(MetricRegistry::new(meter.clone()));

        Self {
            inner: Arc::new(Inner {
                tracer_provider,
                meter_provider,
                tracer,
                meter,
                registry,
                propagator: default_propagator(),
                stack_filters,
            }),
        }
    }

    /// A handle that records nothing: spans are never sampled and the meter
    /// has no reader. The registry still keeps in-process totals.
    pub fn noop() -> Self {
        let tracer_provider = TracerProvider::builder()
            .with_config(SdkTraceConfig::default().with_sampler(Sampler::AlwaysOff))
            .build();
        Self::new(
            tracer_provider,
            SdkMeterProvider::builder().build(),
            DEFAULT_INSTRUMENTATION_SCOPE,
            Vec::new(),
        )
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn meter(&self) -> &Meter {
        &self.inner.meter
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.inner.registry
    }

    pub fn tracer_provider(&self) -> &TracerProvider {
        &self.inner.tracer_provider
    }

    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.inner.meter_provider
    }

    /// Frame prefixes dropped from recovered panic stacks. Empty means the
    /// defaults of [`crate::logging::filter_stack_trace`].
    pub fn stack_filters(&self) -> &[String] {
        &self.inner.stack_filters
    }

    /// Start a span of `kind` as a child of the span in `parent` and return
    /// the context carrying it.
    pub fn start_span(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
    ) -> Context {
        let span = self
            .inner
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.inner.tracer, parent);
        parent.with_span(span)
    }

    /// Extract trace context and baggage from a carrier into a fresh context.
    pub fn extract(&self, extractor: &dyn Extractor) -> Context {
        self.inner
            .propagator
            .extract_with_context(&Context::new(), extractor)
    }

    /// Inject the trace context and baggage of `cx` into a carrier.
    pub fn inject(&self, cx: &Context, injector: &mut dyn Injector) {
        self.inner.propagator.inject_context(cx, injector);
    }

    pub fn extract_http(&self, headers: &http::HeaderMap) -> Context {
        self.extract(&HeaderExtractor(headers))
    }

    pub fn inject_http(&self, cx: &Context, headers: &mut http::HeaderMap) {
        self.inject(cx, &mut HeaderInjector(headers));
    }

    pub fn extract_metadata(&self, metadata: &tonic::metadata::MetadataMap) -> Context {
        self.extract(&MetadataExtractor(metadata))
    }

    pub fn inject_metadata(&self, cx: &Context, metadata: &mut tonic::metadata::MetadataMap) {
        self.inject(cx, &mut MetadataInjector(metadata));
    }
}

/// Intern `scope` as a `'static` name; each distinct owned name is leaked once.
fn static_scope(scope: Cow<'static, str>) -> &'static str {
    static SCOPES: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();

    let owned = match scope {
        Cow::Borrowed(name) => return name,
        Cow::Owned(name) => name,
    };
    let mut scopes = SCOPES
        .get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(name) = scopes.get(owned.as_str()) {
        return name;
    }
    let name: &'static str = Box::leak(owned.into_boxed_str());
    scopes.insert(name);
    name
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("registry", &self.inner.registry)
            .field("stack_filters", &self.inner.stack_filters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::TraceContextExt;

    fn sampled() -> Telemetry {
        let provider = TracerProvider::builder()
            .with_config(SdkTraceConfig::default().with_sampler(Sampler::AlwaysOn))
            .build();
        Telemetry::new(provider, SdkMeterProvider::default(), "telemetry-test", Vec::new())
    }

    #[test]
    fn test_noop_spans_are_not_sampled() {
        let telemetry = Telemetry::noop();
        let cx = telemetry.start_span(&Context::new(), "op", SpanKind::Internal, Vec::new());
        assert!(!cx.span().span_context().is_sampled());
    }

    #[test]
    fn test_start_span_is_child_of_parent() {
        let telemetry = sampled();
        let parent = telemetry.start_span(&Context::new(), "parent", SpanKind::Server, Vec::new());
        let child = telemetry.start_span(&parent, "child", SpanKind::Internal, Vec::new());

        assert_eq!(
            child.span().span_context().trace_id(),
            parent.span().span_context().trace_id()
        );
        assert_ne!(
            child.span().span_context().span_id(),
            parent.span().span_context().span_id()
        );
    }

    #[test]
    fn test_http_round_trip_keeps_trace_and_baggage() {
        let telemetry = sampled();
        let cx = telemetry
            .start_span(&Context::new(), "client", SpanKind::Client, Vec::new())
            .with_baggage(vec![KeyValue::new("tenant", "acme")]);

        let mut headers = http::HeaderMap::new();
        telemetry.inject_http(&cx, &mut headers);
        assert!(headers.contains_key("traceparent"));

        let extracted = telemetry.extract_http(&headers);
        assert_eq!(
            extracted.span().span_context().trace_id(),
            cx.span().span_context().trace_id()
        );
        assert_eq!(
            extracted.baggage().get("tenant").map(|v| v.to_string()),
            Some("acme".to_string())
        );
    }

    #[test]
    fn test_owned_scope_is_interned_once() {
        let first = static_scope(Cow::Owned(format!("scope-{}", 42)));
        let second = static_scope(Cow::Owned("scope-42".to_string()));
        assert_eq!(first, "scope-42");
        assert!(std::ptr::eq(first, second));

        let borrowed = "borrowed-scope";
        assert!(std::ptr::eq(static_scope(Cow::Borrowed(borrowed)), borrowed));
    }

    #[test]
    fn test_extract_ignores_ambient_context() {
        let telemetry = sampled();
        let ambient = telemetry.start_span(&Context::new(), "ambient", SpanKind::Internal, Vec::new());
        let _guard = ambient.attach();

        let extracted = telemetry.extract_http(&http::HeaderMap::new());
        assert!(!extracted.span().span_context().is_valid());
    }
}
