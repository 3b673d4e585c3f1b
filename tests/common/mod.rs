//! Test utilities for o11y integration tests.
//!
//! Provides:
//! - A telemetry handle exporting spans to memory
//! - Lookup helpers for finished spans and their events

#![allow(dead_code)]

use o11y::Telemetry;
use opentelemetry::trace::Status;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::{Config, Sampler, TracerProvider};

/// Telemetry handle whose spans end up in memory.
pub struct TestTelemetry {
    pub telemetry: Telemetry,
    pub exporter: InMemorySpanExporter,
}

impl TestTelemetry {
    /// Sampled tracer, manual metric reader, standard metrics registered.
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let tracer_provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .with_config(Config::default().with_sampler(Sampler::AlwaysOn))
            .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_reader(ManualReader::builder().build())
            .build();

        let telemetry = Telemetry::new(tracer_provider, meter_provider, "o11y-test", Vec::new());
        telemetry.registry().register_standard_metrics();
        Self {
            telemetry,
            exporter,
        }
    }

    /// Every finished span, in end order.
    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter
            .get_finished_spans()
            .expect("in-memory exporter should be readable")
    }

    /// The finished span named `name`.
    pub fn span(&self, name: &str) -> SpanData {
        self.spans()
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no finished span named {name:?}"))
    }
}

impl Default for TestTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribute `key` of the span event named `event`.
pub fn event_attribute(span: &SpanData, event: &str, key: &str) -> Option<String> {
    span.events
        .events
        .iter()
        .find(|e| e.name == event)
        .and_then(|e| e.attributes.iter().find(|kv| kv.key.as_str() == key))
        .map(|kv| kv.value.to_string())
}

/// Attribute `key` of the span itself.
pub fn span_attribute(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.to_string())
}

pub fn is_error(span: &SpanData) -> bool {
    matches!(span.status, Status::Error { .. })
}
