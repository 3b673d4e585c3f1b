//! Lifecycle composition.
//!
//! [`Provider`] initializes logging, tracing and metrics in that order,
//! rolls back what was already started when a later step fails, and shuts
//! everything down again with one call:
//! - metrics and tracing shut down concurrently, each bounded by the deadline
//! - logging shuts down last so the other subsystems can still log
//! - every failure is collected; none stops the others

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{Config as SdkTraceConfig, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use tokio::time::Instant;

use crate::config::{Config, LogConfig, MetricConfig, TraceConfig};
use crate::error::{InitError, ShutdownError, Subsystem, SubsystemFailure};
use crate::logging::setup_logging;
use crate::metrics::runtime::{start_runtime_metrics, RuntimeMetrics};
use crate::metrics::setup_metrics;
use crate::telemetry::Telemetry;
use crate::trace::setup_tracing;

/// A subsystem's shutdown, run at most once.
pub struct ShutdownFn(Box<dyn FnOnce() -> anyhow::Result<()> + Send>);

impl ShutdownFn {
    pub fn new(f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// A shutdown with nothing to do.
    pub fn noop() -> Self {
        Self::new(|| Ok(()))
    }

    pub fn call(self) -> anyhow::Result<()> {
        (self.0)()
    }

    /// Run `self`, then `next`, reporting the first failure.
    #[must_use]
    pub fn then(self, next: ShutdownFn) -> Self {
        Self::new(move || {
            let first = self.call();
            let second = next.call();
            first.and(second)
        })
    }
}

impl fmt::Debug for ShutdownFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownFn")
    }
}

type LogSetup = Box<dyn FnOnce(&LogConfig) -> ShutdownFn>;
type TraceSetup =
    Box<dyn FnOnce(&TraceConfig, &Resource) -> Result<(TracerProvider, ShutdownFn), InitError>>;
type MetricSetup =
    Box<dyn FnOnce(&MetricConfig, &Resource) -> Result<(SdkMeterProvider, ShutdownFn), InitError>>;

/// Builder for a [`Provider`] with replaceable setup steps.
pub struct ProviderBuilder {
    config: Config,
    logging: LogSetup,
    tracing: TraceSetup,
    metrics: MetricSetup,
}

impl ProviderBuilder {
    /// Replace the logging setup.
    #[must_use]
    pub fn with_logging(mut self, setup: impl FnOnce(&LogConfig) -> ShutdownFn + 'static) -> Self {
        self.logging = Box::new(setup);
        self
    }

    /// Replace the tracing setup.
    #[must_use]
    pub fn with_tracing(
        mut self,
        setup: impl FnOnce(&TraceConfig, &Resource) -> Result<(TracerProvider, ShutdownFn), InitError>
            + 'static,
    ) -> Self {
        self.tracing = Box::new(setup);
        self
    }

    /// Replace the metrics setup.
    #[must_use]
    pub fn with_metrics(
        mut self,
        setup: impl FnOnce(&MetricConfig, &Resource) -> Result<(SdkMeterProvider, ShutdownFn), InitError>
            + 'static,
    ) -> Self {
        self.metrics = Box::new(setup);
        self
    }

    /// Initialize every subsystem.
    ///
    /// Exporters and the metrics endpoint are spawned on the current tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns the first setup error after shutting down the subsystems
    /// that were already started, most recent first.
    pub fn build(self) -> Result<Provider, InitError> {
        let cfg = self.config.with_defaults();

        if !cfg.enabled {
            return Ok(Provider::disabled(&cfg));
        }

        let resource = build_resource(&cfg);

        let log_shutdown = (self.logging)(&cfg.log);

        let (tracer_provider, trace_shutdown) = match (self.tracing)(&cfg.trace, &resource) {
            Ok(setup) => setup,
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialize tracing");
                rollback(vec![(Subsystem::Logging, log_shutdown)]);
                return Err(e);
            }
        };

        let (meter_provider, metric_shutdown) = match (self.metrics)(&cfg.metric, &resource) {
            Ok(setup) => setup,
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialize metrics");
                rollback(vec![
                    (Subsystem::Tracing, trace_shutdown),
                    (Subsystem::Logging, log_shutdown),
                ]);
                return Err(e);
            }
        };

        let telemetry = Telemetry::new(
            tracer_provider,
            meter_provider,
            cfg.instrumentation_scope.clone(),
            cfg.log.stack_filters.clone(),
        );

        let mut runtime_metrics = None;
        if cfg.metric.enabled {
            telemetry.registry().register_standard_metrics();

            if cfg.metric.enable_runtime_metrics {
                match start_runtime_metrics(telemetry.meter()) {
                    Ok(metrics) => runtime_metrics = Some(metrics),
                    Err(e) => tracing::warn!(error = %e, "Failed to start runtime metrics"),
                }
            }
        }

        tracing::info!(
            service = %cfg.service,
            trace_exporter = ?cfg.trace.exporter,
            metric_exporter = ?cfg.metric.exporter,
            "Observability initialized"
        );

        Ok(Provider {
            telemetry,
            shutdowns: Mutex::new(Some(Shutdowns {
                logging: log_shutdown,
                tracing: trace_shutdown,
                metrics: metric_shutdown,
            })),
            _runtime_metrics: runtime_metrics,
        })
    }
}

struct Shutdowns {
    logging: ShutdownFn,
    tracing: ShutdownFn,
    metrics: ShutdownFn,
}

/// The initialized logging, tracing and metrics subsystems.
pub struct Provider {
    telemetry: Telemetry,
    /// Taken by the first shutdown.
    shutdowns: Mutex<Option<Shutdowns>>,
    _runtime_metrics: Option<RuntimeMetrics>,
}

impl Provider {
    /// Initialize with the default setup steps.
    ///
    /// # Errors
    ///
    /// See [`ProviderBuilder::build`].
    pub fn new(config: Config) -> Result<Self, InitError> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> ProviderBuilder {
        ProviderBuilder {
            config,
            logging: Box::new(setup_logging),
            tracing: Box::new(setup_tracing),
            metrics: Box::new(setup_metrics),
        }
    }

    fn disabled(cfg: &Config) -> Self {
        let tracer_provider = TracerProvider::builder()
            .with_config(SdkTraceConfig::default().with_sampler(Sampler::AlwaysOff))
            .build();
        let telemetry = Telemetry::new(
            tracer_provider,
            SdkMeterProvider::builder().build(),
            cfg.instrumentation_scope.clone(),
            cfg.log.stack_filters.clone(),
        );
        Self {
            telemetry,
            shutdowns: Mutex::new(None),
            _runtime_metrics: None,
        }
    }

    /// A clone of the telemetry handle.
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.clone()
    }

    /// Shut every subsystem down within `timeout`.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns every subsystem failure, including shutdowns that did not
    /// finish before the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let Some(shutdowns) = self
            .shutdowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        let (metrics_failure, tracing_failure) = tokio::join!(
            bounded(Subsystem::Metrics, shutdowns.metrics, deadline),
            bounded(Subsystem::Tracing, shutdowns.tracing, deadline),
        );

        let mut failures: Vec<SubsystemFailure> = metrics_failure
            .into_iter()
            .chain(tracing_failure)
            .collect();
        for failure in &failures {
            tracing::error!(
                subsystem = %failure.subsystem,
                error = %failure.error,
                "Subsystem shutdown failed"
            );
        }

        if let Err(error) = shutdowns.logging.call() {
            failures.push(SubsystemFailure {
                subsystem: Subsystem::Logging,
                error,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::new(failures))
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

/// Run `shutdown` on the blocking pool, giving up at `deadline`.
async fn bounded(
    subsystem: Subsystem,
    shutdown: ShutdownFn,
    deadline: Instant,
) -> Option<SubsystemFailure> {
    let task = tokio::task::spawn_blocking(move || shutdown.call());
    let error = match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(Ok(()))) => return None,
        Ok(Ok(Err(e))) => e,
        Ok(Err(join_error)) => anyhow::Error::from(join_error).context("shutdown task failed"),
        Err(_) => anyhow::anyhow!("shutdown did not finish before the deadline"),
    };
    Some(SubsystemFailure { subsystem, error })
}

/// Shut down already started subsystems after a failed setup step.
fn rollback(started: Vec<(Subsystem, ShutdownFn)>) {
    for (subsystem, shutdown) in started {
        if let Err(e) = shutdown.call() {
            tracing::warn!(subsystem = %subsystem, error = %e, "Rollback shutdown failed");
        }
    }
}

fn build_resource(cfg: &Config) -> Resource {
    let mut attributes = vec![KeyValue::new("service.name", cfg.service.clone())];
    if !cfg.version.is_empty() {
        attributes.push(KeyValue::new("service.version", cfg.version.clone()));
    }
    if !cfg.environment.is_empty() {
        attributes.push(KeyValue::new(
            "deployment.environment.name",
            cfg.environment.clone(),
        ));
    }
    Resource::default().merge(&Resource::new(attributes))
}
