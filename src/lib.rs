//! o11y: logging, tracing and metrics behind one initialization call.
//!
//! A [`Provider`] wires `tracing` logging, an OpenTelemetry tracer and an
//! OpenTelemetry meter together and hands out a [`Telemetry`] handle. The
//! handle is passed explicitly to everything that records telemetry; there
//! are no package-level tracer or meter globals.
//!
//! # Architecture
//!
//! - **Metric registry**: copy-on-write map of named instruments with
//!   lock-free lookup and in-process running totals
//! - **Run**: wraps a unit of business logic in a span, an enriched logger,
//!   panic recovery and duration/error metrics
//! - **Provider**: ordered startup with rollback, concurrent shutdown with
//!   aggregated errors
//! - **Adapters**: tower layers for HTTP and gRPC servers, HTTP client
//!   layer, gRPC client interceptor, SQL wrapper
//!
//! # Modules
//!
//! - [`config`]: Configuration structs and defaults
//! - [`error`]: Error types
//! - [`logging`]: Subscriber setup and stack trace filtering
//! - [`trace`]: Tracer provider setup and span helpers
//! - [`metrics`]: Meter provider setup, registry, runtime gauges, scrape endpoint
//! - [`telemetry`]: The injected telemetry handle
//! - [`run`]: The operation wrapper
//! - [`panic`]: Backtraces captured at the panic site
//! - [`state`]: Per-operation handle given to the wrapped callback
//! - [`provider`]: Lifecycle composition
//! - [`propagation`]: Header and metadata carriers
//! - [`http`], [`grpc`], [`sql`]: Instrumentation adapters
//!
//! # Example
//!
//! ```no_run
//! use o11y::{Config, Provider};
//! use opentelemetry::Context;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = Provider::new(Config::default())?;
//! let telemetry = provider.telemetry();
//!
//! telemetry
//!     .run(&Context::new(), "ProcessOrder", |_cx, state| async move {
//!         state.inc_counter("cache.client.operation.total", &[]);
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .await?;
//!
//! provider.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::struct_excessive_bools
)]

pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod panic;
pub mod propagation;
pub mod provider;
pub mod run;
pub mod sql;
pub mod state;
pub mod telemetry;
pub mod trace;

pub use config::Config;
pub use error::{BaggageError, InitError, Panicked, ShutdownError, Subsystem};
pub use metrics::registry::{MetricInstrument, MetricRegistry};
pub use provider::{Provider, ProviderBuilder, ShutdownFn};
pub use state::State;
pub use telemetry::Telemetry;
pub use trace::trace_id;
