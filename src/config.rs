//! Configuration for logging, tracing and metrics.
//!
//! Supports:
//! - Deserialization from any serde format (every field has a default)
//! - `FromStr` on the selector enums so CLIs can parse them directly
//! - Defaults filled in for empty values by [`Config::with_defaults`]

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Instrumentation scope used when none is configured.
pub const DEFAULT_INSTRUMENTATION_SCOPE: &str = "o11y";

/// Metrics endpoint listen address used when none is configured.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:2222";

/// Metrics endpoint path used when none is configured.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// OTLP collector endpoint used when none is configured.
pub const DEFAULT_OTLP_ENDPOINT: &str = "localhost:4317";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Global switch. When false, initialization installs nothing and
    /// shutdown is a no-op.
    pub enabled: bool,

    /// Service name, reported as `service.name`.
    pub service: String,

    /// Service version, reported as `service.version`.
    pub version: String,

    /// Deployment environment, reported as `deployment.environment.name`.
    pub environment: String,

    /// Name of the tracer and meter scope.
    pub instrumentation_scope: String,

    pub log: LogConfig,
    pub trace: TraceConfig,
    pub metric: MetricConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            service: "unknown_service".into(),
            version: String::new(),
            environment: String::new(),
            instrumentation_scope: DEFAULT_INSTRUMENTATION_SCOPE.into(),
            log: LogConfig::default(),
            trace: TraceConfig::default(),
            metric: MetricConfig::default(),
        }
    }
}

impl Config {
    /// Fill in defaults for values left empty.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.instrumentation_scope.is_empty() {
            self.instrumentation_scope = DEFAULT_INSTRUMENTATION_SCOPE.into();
        }
        if self.metric.metrics_addr.is_empty() {
            self.metric.metrics_addr = DEFAULT_METRICS_ADDR.into();
        }
        if self.metric.metrics_path.is_empty() {
            self.metric.metrics_path = DEFAULT_METRICS_PATH.into();
        }
        if self.trace.endpoint.is_empty() {
            self.trace.endpoint = DEFAULT_OTLP_ENDPOINT.into();
        }
        if self.metric.endpoint.is_empty() {
            self.metric.endpoint = DEFAULT_OTLP_ENDPOINT.into();
        }
        self
    }

    /// Create an enabled configuration with no-op exporters for testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            enabled: true,
            service: "o11y-test".into(),
            log: LogConfig {
                level: "error".into(),
                ..LogConfig::default()
            },
            trace: TraceConfig {
                enabled: true,
                ..TraceConfig::default()
            },
            metric: MetricConfig {
                enabled: true,
                ..MetricConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `info,my_crate=debug`.
    /// Empty or invalid falls back to `info`.
    pub level: String,

    /// Precision of the Unix timestamps written to the log file.
    pub time_precision: TimePrecision,

    /// Include file and line of the call site.
    pub caller: bool,

    /// Human-readable output on stdout.
    pub console: bool,

    /// JSON output to a rolling file.
    pub file: bool,

    pub rotation: FileRotationConfig,

    /// Frame prefixes dropped from panic stack traces. Empty uses
    /// [`crate::logging::DEFAULT_STACK_FILTERS`].
    pub stack_filters: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            time_precision: TimePrecision::default(),
            caller: false,
            console: true,
            file: false,
            rotation: FileRotationConfig::default(),
            stack_filters: Vec::new(),
        }
    }
}

/// Unix timestamp precision for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePrecision {
    S,
    #[default]
    Ms,
    Us,
    Ns,
}

/// Rolling file settings. Rotation itself is done by `tracing-appender`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileRotationConfig {
    /// Directory the log files are written to.
    pub directory: PathBuf,

    /// File name prefix; the rotation date and `.log` are appended.
    pub file_name_prefix: String,

    pub rotation: Rotation,

    /// Number of rotated files to keep. `None` keeps everything.
    pub max_files: Option<usize>,
}

impl Default for FileRotationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            file_name_prefix: String::new(),
            rotation: Rotation::Daily,
            max_files: Some(7),
        }
    }
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Tracing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,

    pub exporter: TraceExporter,

    /// OTLP collector address, `host:port` or a full URL.
    pub endpoint: String,

    /// Use plaintext gRPC towards the collector.
    pub otlp_insecure: bool,

    /// Fraction of traces sampled, clamped to `[0.0, 1.0]`.
    pub sample_ratio: f64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exporter: TraceExporter::None,
            endpoint: DEFAULT_OTLP_ENDPOINT.into(),
            otlp_insecure: false,
            sample_ratio: 1.0,
        }
    }
}

/// Where spans are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TraceExporter {
    /// OTLP over gRPC to a collector.
    #[serde(rename = "otlp-grpc")]
    OtlpGrpc,
    /// Spans are created and sampled but not exported.
    #[default]
    #[serde(rename = "none")]
    None,
}

impl FromStr for TraceExporter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "otlp-grpc" => Ok(Self::OtlpGrpc),
            "none" | "" => Ok(Self::None),
            _ => Err(format!("unknown trace exporter: {s}")),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub enabled: bool,

    pub exporter: MetricExporter,

    /// OTLP collector address, used by [`MetricExporter::OtlpGrpc`].
    pub endpoint: String,

    /// Push interval for the OTLP exporter.
    pub export_interval_secs: u64,

    /// Path of the scrape endpoint, used by [`MetricExporter::Prometheus`].
    pub metrics_path: String,

    /// Listen address of the scrape endpoint. `:port` binds all interfaces.
    pub metrics_addr: String,

    /// Publish tokio runtime gauges.
    pub enable_runtime_metrics: bool,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exporter: MetricExporter::None,
            endpoint: DEFAULT_OTLP_ENDPOINT.into(),
            export_interval_secs: 10,
            metrics_path: DEFAULT_METRICS_PATH.into(),
            metrics_addr: DEFAULT_METRICS_ADDR.into(),
            enable_runtime_metrics: false,
        }
    }
}

/// How metrics leave the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum MetricExporter {
    /// HTTP scrape endpoint rendering the registry in Prometheus text format.
    #[serde(rename = "prometheus")]
    Prometheus,
    /// Periodic OTLP push over gRPC.
    #[serde(rename = "otlp-grpc")]
    OtlpGrpc,
    /// Instruments record but nothing is exported.
    #[default]
    #[serde(rename = "none")]
    None,
}

impl FromStr for MetricExporter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prometheus" => Ok(Self::Prometheus),
            "otlp-grpc" => Ok(Self::OtlpGrpc),
            "none" | "" => Ok(Self::None),
            _ => Err(format!("unknown metric exporter: {s}")),
        }
    }
}
