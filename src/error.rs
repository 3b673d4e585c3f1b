//! Error types.
//!
//! - [`InitError`]: fatal setup failures surfaced from [`crate::Provider::new`]
//! - [`Panicked`]: a panic recovered by [`crate::Telemetry::run`]
//! - [`BaggageError`]: rejected baggage members
//! - [`ShutdownError`]: every subsystem failure seen during shutdown

use std::fmt;

use thiserror::Error;

/// One of the three subsystems managed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Logging,
    Tracing,
    Metrics,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Logging => "logging",
            Self::Tracing => "tracing",
            Self::Metrics => "metrics",
        };
        f.write_str(name)
    }
}

/// Error returned when a subsystem cannot be initialized.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Failed to create trace exporter: {0}")]
    TraceExporter(#[from] opentelemetry::trace::TraceError),

    #[error("Failed to create metrics pipeline: {0}")]
    MetricsPipeline(#[from] opentelemetry::metrics::MetricsError),

    #[error("Invalid metrics listen address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("Failed to bind metrics server on {addr}: {source}")]
    MetricsServer {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file writer: {0}")]
    LogFile(#[from] tracing_appender::rolling::InitError),

    #[error("Runtime metrics need a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("{subsystem} setup failed: {source}")]
    Setup {
        subsystem: Subsystem,
        #[source]
        source: anyhow::Error,
    },
}

impl InitError {
    /// Wrap an arbitrary failure from a custom setup function.
    pub fn setup(subsystem: Subsystem, source: impl Into<anyhow::Error>) -> Self {
        Self::Setup {
            subsystem,
            source: source.into(),
        }
    }
}

/// A panic caught at the boundary of an instrumented operation.
///
/// Callers fold it into their own error type through `From<Panicked>`;
/// `anyhow::Error` accepts it as is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("panic recovered in operation {operation:?}: {message}")]
pub struct Panicked {
    operation: String,
    message: String,
}

impl Panicked {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Name of the operation that panicked.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The panic payload rendered as text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A baggage member that cannot be propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BaggageError {
    #[error("baggage key is empty")]
    EmptyKey,

    #[error("baggage key {0:?} contains characters outside the token set")]
    InvalidKey(String),

    #[error("baggage member {key:?} is {len} bytes, max {max}")]
    MemberTooLarge { key: String, len: usize, max: usize },

    #[error("baggage would hold {count} members, max {max}")]
    TooManyMembers { count: usize, max: usize },

    #[error("baggage would be {len} bytes, max {max}")]
    TooLarge { len: usize, max: usize },
}

/// A single subsystem that failed to shut down.
#[derive(Debug)]
pub struct SubsystemFailure {
    pub subsystem: Subsystem,
    pub error: anyhow::Error,
}

/// Every failure collected while shutting the provider down.
#[derive(Debug, Error)]
pub struct ShutdownError {
    failures: Vec<SubsystemFailure>,
}

impl ShutdownError {
    pub(crate) fn new(failures: Vec<SubsystemFailure>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[SubsystemFailure] {
        &self.failures
    }

    /// Whether the given subsystem is among the failures.
    pub fn failed(&self, subsystem: Subsystem) -> bool {
        self.failures.iter().any(|f| f.subsystem == subsystem)
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown failed")?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {:#}", failure.subsystem, failure.error)?;
        }
        Ok(())
    }
}
