//! Metrics: meter provider setup, the instrument registry, runtime gauges
//! and the Prometheus scrape endpoint.
//!
//! Standard metric names:
//! - `http.server.request.duration`, `http.server.request.total`,
//!   `http.server.active_requests`: inbound HTTP
//! - `http.client.request.duration`: outbound HTTP
//! - `rpc.server.duration`, `rpc.server.panic.total`: inbound gRPC
//! - `db.client.query.duration`: SQL
//! - `biz.operation.duration`, `biz.operation.error.total`: [`crate::Telemetry::run`]
//! - `cache.client.operation.total`: cache hits and misses

pub mod registry;
pub mod runtime;
pub mod server;

use std::fmt;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::MetricsError;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::{
    new_view, Aggregation, Instrument, ManualReader, SdkMeterProvider, Stream, View,
};
use opentelemetry_sdk::{runtime as sdk_runtime, Resource};

use crate::config::{MetricConfig, MetricExporter};
use crate::error::InitError;
use crate::provider::ShutdownFn;
use crate::trace::otlp_endpoint;

/// Names of the standard metrics.
pub mod names {
    pub const HTTP_SERVER_REQUEST_DURATION: &str = "http.server.request.duration";
    pub const HTTP_SERVER_REQUEST_TOTAL: &str = "http.server.request.total";
    pub const HTTP_SERVER_ACTIVE_REQUESTS: &str = "http.server.active_requests";
    pub const HTTP_CLIENT_REQUEST_DURATION: &str = "http.client.request.duration";
    pub const RPC_SERVER_DURATION: &str = "rpc.server.duration";
    pub const RPC_SERVER_PANIC_TOTAL: &str = "rpc.server.panic.total";
    pub const DB_CLIENT_QUERY_DURATION: &str = "db.client.query.duration";
    pub const BIZ_OPERATION_DURATION: &str = "biz.operation.duration";
    pub const BIZ_OPERATION_ERROR_TOTAL: &str = "biz.operation.error.total";
    pub const CACHE_CLIENT_OPERATION_TOTAL: &str = "cache.client.operation.total";
}

/// Kind of a registered instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Counter,
    Histogram,
    UpDownCounter,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Histogram => "histogram",
            Self::UpDownCounter => "up_down_counter",
        };
        f.write_str(name)
    }
}

/// A metric registered by [`registry::MetricRegistry::register_standard_metrics`].
#[derive(Debug, Clone, Copy)]
pub struct StandardMetric {
    pub name: &'static str,
    pub kind: InstrumentKind,
    pub description: &'static str,
    pub unit: &'static str,
}

pub const STANDARD_METRICS: &[StandardMetric] = &[
    StandardMetric {
        name: names::HTTP_SERVER_REQUEST_DURATION,
        kind: InstrumentKind::Histogram,
        description: "Duration of HTTP server requests",
        unit: "s",
    },
    StandardMetric {
        name: names::HTTP_SERVER_REQUEST_TOTAL,
        kind: InstrumentKind::Counter,
        description: "Total number of HTTP server requests",
        unit: "{request}",
    },
    StandardMetric {
        name: names::HTTP_SERVER_ACTIVE_REQUESTS,
        kind: InstrumentKind::UpDownCounter,
        description: "Number of in-flight HTTP server requests",
        unit: "{request}",
    },
    StandardMetric {
        name: names::HTTP_CLIENT_REQUEST_DURATION,
        kind: InstrumentKind::Histogram,
        description: "Duration of HTTP client requests",
        unit: "s",
    },
    StandardMetric {
        name: names::RPC_SERVER_DURATION,
        kind: InstrumentKind::Histogram,
        description: "Duration of RPC server calls",
        unit: "s",
    },
    StandardMetric {
        name: names::RPC_SERVER_PANIC_TOTAL,
        kind: InstrumentKind::Counter,
        description: "Total number of panics recovered in RPC handlers",
        unit: "{panic}",
    },
    StandardMetric {
        name: names::DB_CLIENT_QUERY_DURATION,
        kind: InstrumentKind::Histogram,
        description: "Duration of database queries",
        unit: "s",
    },
    StandardMetric {
        name: names::BIZ_OPERATION_DURATION,
        kind: InstrumentKind::Histogram,
        description: "Duration of business operations",
        unit: "s",
    },
    StandardMetric {
        name: names::BIZ_OPERATION_ERROR_TOTAL,
        kind: InstrumentKind::Counter,
        description: "Total number of failed business operations",
        unit: "{error}",
    },
    StandardMetric {
        name: names::CACHE_CLIENT_OPERATION_TOTAL,
        kind: InstrumentKind::Counter,
        description: "Total number of cache operations",
        unit: "{event}",
    },
];

/// Bucket boundaries, in seconds, of the `*duration` histograms.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn duration_view() -> Result<Box<dyn View>, MetricsError> {
    new_view(
        Instrument::new().name("*duration"),
        Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: DURATION_BUCKETS.to_vec(),
            record_min_max: true,
        }),
    )
}

/// Build the meter provider described by `cfg`.
///
/// [`MetricExporter::Prometheus`] reads the provider into a
/// [`prometheus::Registry`] and binds the scrape endpoint here, so it needs
/// a tokio runtime. The returned shutdown stops the endpoint before the
/// provider.
///
/// # Errors
///
/// Returns an error if the OTLP pipeline cannot be built or the scrape
/// endpoint cannot be bound.
pub fn setup_metrics(
    cfg: &MetricConfig,
    resource: &Resource,
) -> Result<(SdkMeterProvider, ShutdownFn), InitError> {
    if !cfg.enabled {
        let provider = SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .build();
        return Ok((provider, ShutdownFn::noop()));
    }

    let mut server_shutdown = None;
    let provider = match cfg.exporter {
        MetricExporter::OtlpGrpc => {
            // No TLS settings for metrics push: plaintext unless a scheme is given.
            let endpoint = otlp_endpoint(&cfg.endpoint, true);
            tracing::info!(endpoint = %endpoint, "Initializing OTLP gRPC metrics exporter");

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            opentelemetry_otlp::new_pipeline()
                .metrics(sdk_runtime::Tokio)
                .with_exporter(exporter)
                .with_period(Duration::from_secs(cfg.export_interval_secs.max(1)))
                .with_resource(resource.clone())
                .build()?
        }
        MetricExporter::Prometheus => {
            tracing::info!(
                address = %cfg.metrics_addr,
                path = %cfg.metrics_path,
                "Initializing Prometheus metrics exporter"
            );
            let registry = prometheus::Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()?;
            let provider = SdkMeterProvider::builder()
                .with_reader(exporter)
                .with_view(duration_view()?)
                .with_resource(resource.clone())
                .build();

            match server::serve_metrics(&cfg.metrics_addr, &cfg.metrics_path, registry) {
                Ok(shutdown) => server_shutdown = Some(shutdown),
                Err(e) => {
                    if let Err(shutdown_err) = provider.shutdown() {
                        tracing::warn!(error = %shutdown_err, "Failed to shut down meter provider");
                    }
                    return Err(e);
                }
            }
            provider
        }
        MetricExporter::None => {
            tracing::info!("Initializing no-op metrics exporter");
            // Metrics are recorded but only read back in-process.
            SdkMeterProvider::builder()
                .with_reader(ManualReader::builder().build())
                .with_view(duration_view()?)
                .with_resource(resource.clone())
                .build()
        }
    };

    global::set_meter_provider(provider.clone());

    let handle = provider.clone();
    let mut shutdown = ShutdownFn::new(move || handle.shutdown().map_err(anyhow::Error::from));
    if let Some(server_shutdown) = server_shutdown {
        shutdown = server_shutdown.then(shutdown);
    }
    Ok((provider, shutdown))
}
