//! Copy-on-write registry of named metric instruments.
//!
//! - Writes (registration) serialize on a mutex, copy the current map,
//!   insert, and publish the new map with one atomic swap
//! - Reads (recording) do one atomic load and never block
//! - Running totals per name are kept in-process so values can be read back
//!   without going through an exporter

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

use super::{InstrumentKind, STANDARD_METRICS};

/// Name, description and unit of a registered instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    pub unit: String,
}

impl Descriptor {
    fn new(name: &str, description: &str, unit: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
        })
    }
}

/// Monotonic counter plus its running total.
#[derive(Clone)]
pub struct CounterHandle {
    descriptor: Arc<Descriptor>,
    counter: Counter<u64>,
    total: Arc<AtomicI64>,
}

impl CounterHandle {
    pub fn add(&self, value: u64, attributes: &[KeyValue]) {
        self.counter.add(value, attributes);
        self.total
            .fetch_add(i64::try_from(value).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Running total across every registration of this name.
    pub fn value(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Up-down counter plus its running total.
#[derive(Clone)]
pub struct UpDownCounterHandle {
    descriptor: Arc<Descriptor>,
    counter: UpDownCounter<i64>,
    total: Arc<AtomicI64>,
}

impl UpDownCounterHandle {
    pub fn add(&self, value: i64, attributes: &[KeyValue]) {
        self.counter.add(value, attributes);
        self.total.fetch_add(value, Ordering::Relaxed);
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn value(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Sample count and sum of a histogram.
#[derive(Debug, Default)]
pub struct HistogramStats {
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl HistogramStats {
    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

/// Histogram plus its sample statistics.
#[derive(Clone)]
pub struct HistogramHandle {
    descriptor: Arc<Descriptor>,
    histogram: Histogram<f64>,
    stats: Arc<HistogramStats>,
}

impl HistogramHandle {
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        self.histogram.record(value, attributes);
        self.stats.observe(value);
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> &HistogramStats {
        &self.stats
    }
}

/// A registered instrument. Exactly one kind per name.
#[derive(Clone)]
pub enum MetricInstrument {
    Counter(CounterHandle),
    Histogram(HistogramHandle),
    UpDownCounter(UpDownCounterHandle),
}

impl MetricInstrument {
    pub fn kind(&self) -> InstrumentKind {
        match self {
            Self::Counter(_) => InstrumentKind::Counter,
            Self::Histogram(_) => InstrumentKind::Histogram,
            Self::UpDownCounter(_) => InstrumentKind::UpDownCounter,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Self::Counter(h) => h.descriptor(),
            Self::Histogram(h) => h.descriptor(),
            Self::UpDownCounter(h) => h.descriptor(),
        }
    }
}

impl fmt::Debug for MetricInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricInstrument")
            .field("kind", &self.kind())
            .field("name", &self.descriptor().name)
            .finish()
    }
}

/// Point-in-time value of one instrument as seen in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
    pub value: SnapshotValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SnapshotValue {
    /// Running total of a counter or up-down counter.
    Total(i64),
    /// Sample count and sum of a histogram.
    Samples { count: u64, sum: f64 },
}

type InstrumentMap = HashMap<String, MetricInstrument>;

/// Registry mapping metric names to instruments.
///
/// Recording against a name that is not registered, or registered with a
/// different kind, is logged and dropped. Instrumentation call sites never
/// see an error.
pub struct MetricRegistry {
    meter: Meter,
    instruments: ArcSwap<InstrumentMap>,
    /// Serializes copy-on-write updates of `instruments`.
    write_lock: Mutex<()>,
    totals: DashMap<String, Arc<AtomicI64>>,
    histograms: DashMap<String, Arc<HistogramStats>>,
    standard: Once,
}

impl MetricRegistry {
    /// Create an empty registry creating instruments from `meter`.
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            instruments: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            totals: DashMap::new(),
            histograms: DashMap::new(),
            standard: Once::new(),
        }
    }

    /// Register the standard HTTP, RPC, database and operation metrics.
    ///
    /// Only the first call on a registry registers anything.
    pub fn register_standard_metrics(&self) {
        self.standard.call_once(|| {
            tracing::debug!("Initializing standard metrics registry");
            for metric in STANDARD_METRICS {
                match metric.kind {
                    InstrumentKind::Counter => {
                        self.register_counter(metric.name, metric.description, metric.unit);
                    }
                    InstrumentKind::Histogram => {
                        self.register_histogram(metric.name, metric.description, metric.unit);
                    }
                    InstrumentKind::UpDownCounter => {
                        self.register_up_down_counter(
                            metric.name,
                            metric.description,
                            metric.unit,
                        );
                    }
                }
            }
            tracing::info!(count = STANDARD_METRICS.len(), "Standard metrics registry initialized");
        });
    }

    /// Create and register a `u64` counter.
    ///
    /// Returns `None` (and installs nothing) if the instrument cannot be
    /// created. Registering an existing name replaces it.
    pub fn register_counter(
        &self,
        name: &str,
        description: &str,
        unit: &str,
    ) -> Option<CounterHandle> {
        let counter = self
            .meter
            .u64_counter(name.to_string())
            .with_description(description.to_string())
            .with_unit(unit.to_string())
            .try_init();
        let counter = match counter {
            Ok(counter) => counter,
            Err(e) => {
                tracing::error!(metric = name, error = %e, "Failed to create counter");
                return None;
            }
        };

        let handle = CounterHandle {
            descriptor: Descriptor::new(name, description, unit),
            counter,
            total: self.total_for(name, InstrumentKind::Counter),
        };
        self.install(name, MetricInstrument::Counter(handle.clone()));
        Some(handle)
    }

    /// Create and register an `f64` histogram.
    pub fn register_histogram(
        &self,
        name: &str,
        description: &str,
        unit: &str,
    ) -> Option<HistogramHandle> {
        let histogram = self
            .meter
            .f64_histogram(name.to_string())
            .with_description(description.to_string())
            .with_unit(unit.to_string())
            .try_init();
        let histogram = match histogram {
            Ok(histogram) => histogram,
            Err(e) => {
                tracing::error!(metric = name, error = %e, "Failed to create histogram");
                return None;
            }
        };

        let stats = self.stats_for(name);
        let handle = HistogramHandle {
            descriptor: Descriptor::new(name, description, unit),
            histogram,
            stats,
        };
        self.install(name, MetricInstrument::Histogram(handle.clone()));
        Some(handle)
    }

    /// Create and register an `i64` up-down counter.
    pub fn register_up_down_counter(
        &self,
        name: &str,
        description: &str,
        unit: &str,
    ) -> Option<UpDownCounterHandle> {
        let counter = self
            .meter
            .i64_up_down_counter(name.to_string())
            .with_description(description.to_string())
            .with_unit(unit.to_string())
            .try_init();
        let counter = match counter {
            Ok(counter) => counter,
            Err(e) => {
                tracing::error!(metric = name, error = %e, "Failed to create up-down counter");
                return None;
            }
        };

        let handle = UpDownCounterHandle {
            descriptor: Descriptor::new(name, description, unit),
            counter,
            total: self.total_for(name, InstrumentKind::UpDownCounter),
        };
        self.install(name, MetricInstrument::UpDownCounter(handle.clone()));
        Some(handle)
    }

    /// Add `value` to the counter registered as `name`.
    pub fn add_counter(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        let instruments = self.instruments.load();
        match instruments.get(name) {
            Some(MetricInstrument::Counter(counter)) => counter.add(value, attributes),
            Some(other) => type_mismatch(name, InstrumentKind::Counter, other.kind()),
            None => not_registered(name),
        }
    }

    /// Add `value` (possibly negative) to the up-down counter registered as `name`.
    pub fn add_up_down_counter(&self, name: &str, value: i64, attributes: &[KeyValue]) {
        let instruments = self.instruments.load();
        match instruments.get(name) {
            Some(MetricInstrument::UpDownCounter(counter)) => counter.add(value, attributes),
            Some(other) => type_mismatch(name, InstrumentKind::UpDownCounter, other.kind()),
            None => not_registered(name),
        }
    }

    /// Record `value` in the histogram registered as `name`.
    pub fn record_histogram(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        let instruments = self.instruments.load();
        match instruments.get(name) {
            Some(MetricInstrument::Histogram(histogram)) => histogram.record(value, attributes),
            Some(other) => type_mismatch(name, InstrumentKind::Histogram, other.kind()),
            None => not_registered(name),
        }
    }

    /// Running total of the counter or up-down counter `name`; 0 if unknown.
    pub fn value(&self, name: &str) -> i64 {
        self.totals
            .get(name)
            .map_or(0, |total| total.load(Ordering::Relaxed))
    }

    /// Number of samples recorded in histogram `name`; 0 if unknown.
    pub fn sample_count(&self, name: &str) -> u64 {
        self.histograms.get(name).map_or(0, |stats| stats.count())
    }

    /// Sum of the samples recorded in histogram `name`; 0.0 if unknown.
    pub fn sample_sum(&self, name: &str) -> f64 {
        self.histograms.get(name).map_or(0.0, |stats| stats.sum())
    }

    /// The instrument currently registered as `name`.
    pub fn get(&self, name: &str) -> Option<MetricInstrument> {
        self.instruments.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instruments.load().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.instruments.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-process values of every registered instrument, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let instruments = self.instruments.load_full();
        let mut snapshot: Vec<MetricSnapshot> = instruments
            .values()
            .map(|instrument| {
                let descriptor = instrument.descriptor();
                let value = match instrument {
                    MetricInstrument::Counter(h) => SnapshotValue::Total(h.value()),
                    MetricInstrument::UpDownCounter(h) => SnapshotValue::Total(h.value()),
                    MetricInstrument::Histogram(h) => SnapshotValue::Samples {
                        count: h.stats().count(),
                        sum: h.stats().sum(),
                    },
                };
                MetricSnapshot {
                    name: descriptor.name.clone(),
                    description: descriptor.description.clone(),
                    unit: descriptor.unit.clone(),
                    kind: instrument.kind(),
                    value,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Running total shared by registrations of `name` with the same kind.
    /// A kind change starts again from zero.
    fn total_for(&self, name: &str, kind: InstrumentKind) -> Arc<AtomicI64> {
        if self.get(name).is_some_and(|existing| existing.kind() != kind) {
            let fresh = Arc::new(AtomicI64::new(0));
            self.totals.insert(name.to_string(), Arc::clone(&fresh));
            return fresh;
        }
        Arc::clone(&self.totals.entry(name.to_string()).or_default())
    }

    fn stats_for(&self, name: &str) -> Arc<HistogramStats> {
        if self
            .get(name)
            .is_some_and(|existing| existing.kind() != InstrumentKind::Histogram)
        {
            let fresh = Arc::new(HistogramStats::default());
            self.histograms.insert(name.to_string(), Arc::clone(&fresh));
            return fresh;
        }
        Arc::clone(&self.histograms.entry(name.to_string()).or_default())
    }

    fn install(&self, name: &str, instrument: MetricInstrument) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Statistics of the other shape would otherwise outlive a kind change.
        if instrument.kind() == InstrumentKind::Histogram {
            self.totals.remove(name);
        } else {
            self.histograms.remove(name);
        }

        let mut next: InstrumentMap = (**self.instruments.load()).clone();
        if next.insert(name.to_string(), instrument).is_some() {
            tracing::warn!(metric = name, "Overwriting existing metric definition in registry");
        }
        self.instruments.store(Arc::new(next));
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("instruments", &self.len())
            .finish_non_exhaustive()
    }
}

fn not_registered(name: &str) {
    tracing::debug!(metric = name, "Metric not registered, skipping record");
}

fn type_mismatch(name: &str, expected: InstrumentKind, actual: InstrumentKind) {
    tracing::warn!(
        metric = name,
        expected = %expected,
        actual = %actual,
        "Metric type mismatch, skipping record"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::names;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    /// The provider must outlive the registry's instruments.
    fn registry() -> (SdkMeterProvider, MetricRegistry) {
        let provider = SdkMeterProvider::default();
        let registry = MetricRegistry::new(provider.meter("registry-test"));
        (provider, registry)
    }

    #[test]
    fn test_unregistered_metric_is_noop() {
        let (_provider, registry) = registry();

        registry.add_counter("non_existent_metric", 1, &[]);
        registry.add_up_down_counter("non_existent_gauge", -1, &[]);
        registry.record_histogram("non_existent_histogram", 123.45, &[]);

        assert!(registry.is_empty());
        assert_eq!(registry.value("non_existent_metric"), 0);
        assert_eq!(registry.sample_count("non_existent_histogram"), 0);
    }

    #[test]
    fn test_register_and_record_counter() {
        let (_provider, registry) = registry();

        let handle = registry
            .register_counter("dynamic_counter", "desc", "1")
            .expect("counter should register");
        registry.add_counter("dynamic_counter", 10, &[KeyValue::new("k", "v")]);
        handle.add(5, &[]);

        assert_eq!(registry.value("dynamic_counter"), 15);
        assert_eq!(handle.value(), 15);
        assert_eq!(
            registry.get("dynamic_counter").map(|i| i.kind()),
            Some(InstrumentKind::Counter)
        );
    }

    #[test]
    fn test_concurrent_counter_updates_are_not_lost() {
        let (_provider, registry) = registry();
        registry.register_counter("concurrent_counter", "desc", "1");

        const THREADS: usize = 8;
        const ITERATIONS: usize = 1_000;

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ITERATIONS {
                        registry.add_counter("concurrent_counter", 1, &[]);
                    }
                });
            }
        });

        assert_eq!(
            registry.value("concurrent_counter"),
            (THREADS * ITERATIONS) as i64
        );
    }

    #[test]
    fn test_concurrent_registration_and_recording() {
        let (_provider, registry) = registry();
        registry.register_counter("hot_counter", "desc", "1");

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..100 {
                    registry.register_histogram(&format!("late_{i}"), "desc", "s");
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        registry.add_counter("hot_counter", 1, &[]);
                    }
                });
            }
        });

        assert_eq!(registry.len(), 101);
        assert_eq!(registry.value("hot_counter"), 2_000);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let (_provider, registry) = registry();

        registry.register_counter("reused", "first", "1");
        registry.add_counter("reused", 3, &[]);
        registry.register_counter("reused", "second", "1");

        assert_eq!(registry.len(), 1);
        let instrument = registry.get("reused").expect("still registered");
        assert_eq!(instrument.descriptor().description, "second");
        // The running total belongs to the name, not the registration.
        assert_eq!(registry.value("reused"), 3);

        registry.register_histogram("reused", "third", "s");
        assert_eq!(
            registry.get("reused").map(|i| i.kind()),
            Some(InstrumentKind::Histogram)
        );
    }

    #[test]
    fn test_kind_change_resets_running_totals() {
        let (_provider, registry) = registry();

        registry.register_counter("shape_shift", "counter", "1");
        registry.add_counter("shape_shift", 5, &[]);
        registry.register_histogram("shape_shift", "histogram", "s");
        registry.record_histogram("shape_shift", 0.5, &[]);

        assert_eq!(registry.value("shape_shift"), 0);
        assert_eq!(registry.sample_count("shape_shift"), 1);

        registry.register_up_down_counter("shape_shift", "gauge", "1");
        registry.add_up_down_counter("shape_shift", -2, &[]);

        assert_eq!(registry.sample_count("shape_shift"), 0);
        assert_eq!(registry.value("shape_shift"), -2);

        registry.register_counter("shape_shift", "counter again", "1");
        registry.add_counter("shape_shift", 1, &[]);
        assert_eq!(registry.value("shape_shift"), 1);
    }

    #[test]
    fn test_type_mismatch_is_dropped() {
        let (_provider, registry) = registry();
        registry.register_counter("mismatch_test", "desc", "1");

        registry.record_histogram("mismatch_test", 10.5, &[]);
        registry.add_up_down_counter("mismatch_test", 4, &[]);

        assert_eq!(registry.sample_count("mismatch_test"), 0);
        assert_eq!(registry.value("mismatch_test"), 0);
    }

    #[test]
    fn test_histogram_stats() {
        let (_provider, registry) = registry();
        registry.register_histogram("latency", "desc", "s");

        registry.record_histogram("latency", 0.25, &[]);
        registry.record_histogram("latency", 0.75, &[]);

        assert_eq!(registry.sample_count("latency"), 2);
        assert!((registry.sample_sum("latency") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_up_down_counter_total() {
        let (_provider, registry) = registry();
        registry.register_up_down_counter("in_flight", "desc", "{request}");

        registry.add_up_down_counter("in_flight", 1, &[]);
        registry.add_up_down_counter("in_flight", 1, &[]);
        registry.add_up_down_counter("in_flight", -1, &[]);

        assert_eq!(registry.value("in_flight"), 1);
    }

    #[test]
    fn test_standard_metrics_registered_once() {
        let (_provider, registry) = registry();

        registry.register_standard_metrics();
        registry.add_counter(names::BIZ_OPERATION_ERROR_TOTAL, 2, &[]);
        registry.register_standard_metrics();

        assert_eq!(registry.len(), STANDARD_METRICS.len());
        assert!(registry.contains(names::BIZ_OPERATION_DURATION));
        assert!(registry.contains(names::HTTP_SERVER_ACTIVE_REQUESTS));
        assert_eq!(registry.value(names::BIZ_OPERATION_ERROR_TOTAL), 2);
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let (_provider, registry) = registry();
        registry.register_counter("b.total", "b", "1");
        registry.register_histogram("a.duration", "a", "s");
        registry.add_counter("b.total", 4, &[]);
        registry.record_histogram("a.duration", 2.0, &[]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a.duration");
        assert_eq!(
            snapshot[0].value,
            SnapshotValue::Samples { count: 1, sum: 2.0 }
        );
        assert_eq!(snapshot[1].value, SnapshotValue::Total(4));
    }
}
