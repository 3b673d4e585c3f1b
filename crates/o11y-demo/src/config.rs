//! Command-line configuration for the demo service.
//!
//! Every flag falls back to an environment variable, then to a default
//! that runs without a collector.

use clap::Parser;
use o11y::config::{MetricExporter, TraceExporter};

/// Order service demonstrating o11y instrumentation.
#[derive(Parser, Debug, Clone)]
#[command(name = "o11y-demo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address the HTTP API listens on
    #[arg(long, env = "DEMO_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Service name reported in the resource
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "o11y-demo")]
    pub service: String,

    /// Deployment environment reported in the resource
    #[arg(long, env = "DEMO_ENVIRONMENT", default_value = "development")]
    pub environment: String,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Trace exporter (otlp-grpc, none)
    #[arg(long, env = "DEMO_TRACE_EXPORTER", default_value = "none")]
    pub trace_exporter: TraceExporter,

    /// Metric exporter (prometheus, otlp-grpc, none)
    #[arg(long, env = "DEMO_METRIC_EXPORTER", default_value = "prometheus")]
    pub metric_exporter: MetricExporter,

    /// OpenTelemetry collector endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", default_value = "localhost:4317")]
    pub otlp_endpoint: String,

    /// Talk to the collector without TLS
    #[arg(long, env = "DEMO_OTLP_INSECURE")]
    pub otlp_insecure: bool,

    /// Prometheus scrape endpoint listen address
    #[arg(long, env = "DEMO_METRICS_ADDR", default_value = "0.0.0.0:2222")]
    pub metrics_addr: String,

    /// Fraction of new traces to sample
    #[arg(long, env = "DEMO_SAMPLE_RATIO", default_value_t = 1.0)]
    pub sample_ratio: f64,

    /// Seconds to wait for exporters to flush on shutdown
    #[arg(long, env = "DEMO_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

impl Args {
    /// Observability configuration derived from the flags.
    pub fn observability(&self) -> o11y::Config {
        let mut config = o11y::Config {
            enabled: true,
            service: self.service.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            environment: self.environment.clone(),
            ..o11y::Config::default()
        };
        config.log.level = self.log_level.clone();

        config.trace.enabled = self.trace_exporter != TraceExporter::None;
        config.trace.exporter = self.trace_exporter;
        config.trace.endpoint = self.otlp_endpoint.clone();
        config.trace.otlp_insecure = self.otlp_insecure;
        config.trace.sample_ratio = self.sample_ratio;

        config.metric.enabled = true;
        config.metric.exporter = self.metric_exporter;
        config.metric.endpoint = self.otlp_endpoint.clone();
        config.metric.metrics_addr = self.metrics_addr.clone();
        config.metric.enable_runtime_metrics = true;
        config
    }
}
