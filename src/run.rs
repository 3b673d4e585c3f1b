//! The operation wrapper.
//!
//! [`Telemetry::run`] wraps one unit of business logic with:
//! - a span named after the operation, child of any span in the given context
//! - a `tracing` span carrying `operation`, `trace_id` and `span_id`
//! - panic recovery that turns a panic into the caller's error type
//! - `biz.operation.duration` on every path and `biz.operation.error.total`
//!   on failure

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use opentelemetry::trace::{
    FutureExt as _, SpanKind, Status, TraceContextExt, Tracer as _,
};
use opentelemetry::{Context, KeyValue};
use tracing::Instrument;

use crate::error::Panicked;
use crate::logging::filter_stack_trace;
use crate::panic::take_backtrace;
use crate::metrics::names::{BIZ_OPERATION_DURATION, BIZ_OPERATION_ERROR_TOTAL};
use crate::metrics::registry::MetricRegistry;
use crate::state::State;
use crate::telemetry::Telemetry;
use crate::trace::record_exception;

impl Telemetry {
    /// Run `f` as the operation `name`.
    ///
    /// `f` receives the context carrying the operation's span and a
    /// [`State`]. Its result is returned unchanged; a panic inside it is
    /// caught and returned as `E::from(Panicked)`. This never panics.
    ///
    /// # Arguments
    ///
    /// * `cx` - Parent context; its span becomes the parent of the new span
    /// * `name` - Operation name used for the span, log fields and metrics
    /// * `f` - The business logic
    pub async fn run<T, E, F, Fut>(&self, cx: &Context, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Context, State) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Panicked> + fmt::Display,
    {
        let operation = name.to_string();

        let span = self
            .tracer()
            .span_builder(operation.clone())
            .with_kind(SpanKind::Internal)
            .start_with_context(self.tracer(), cx);
        let op_cx = cx.with_span(span);

        let log = {
            let span_context = op_cx.span().span_context().clone();
            // Error level keeps the fields on events under any level filter.
            tracing::error_span!(
                "operation",
                operation = %operation,
                trace_id = %span_context.trace_id(),
                span_id = %span_context.span_id(),
            )
        };

        let state = State::new(operation.clone(), op_cx.clone(), log.clone(), self.clone());
        let duration = DurationGuard::new(Arc::clone(self.registry()), operation.clone());

        let callback_cx = op_cx.clone();
        let outcome = AssertUnwindSafe(async move { f(callback_cx, state).await })
            .catch_unwind()
            .instrument(log.clone())
            .with_context(op_cx.clone())
            .await;

        let error_attributes = [KeyValue::new("operation", operation.clone())];
        let span = op_cx.span();
        let result = match outcome {
            Ok(Ok(value)) => {
                span.set_status(Status::Ok);
                Ok(value)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                record_exception(&span, &message, None);
                span.set_status(Status::error(message));
                self.registry()
                    .add_counter(BIZ_OPERATION_ERROR_TOTAL, 1, &error_attributes);
                Err(e)
            }
            Err(payload) => {
                let panicked = Panicked::new(operation.clone(), panic_message(payload.as_ref()));
                let stack = filter_stack_trace(&take_backtrace(), self.stack_filters());

                record_exception(&span, &panicked.to_string(), Some(&stack));
                span.set_status(Status::error("panic occurred"));
                log.in_scope(|| {
                    tracing::error!(
                        panic = %panicked.message(),
                        stack = %stack,
                        "Panic recovered during operation"
                    );
                });
                self.registry()
                    .add_counter(BIZ_OPERATION_ERROR_TOTAL, 1, &error_attributes);
                Err(E::from(panicked))
            }
        };

        drop(duration);
        span.end();
        result
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Records `biz.operation.duration` once, when dropped.
struct DurationGuard {
    registry: Arc<MetricRegistry>,
    operation: String,
    start: Instant,
}

impl DurationGuard {
    fn new(registry: Arc<MetricRegistry>, operation: String) -> Self {
        Self {
            registry,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        let attributes = [KeyValue::new("operation", std::mem::take(&mut self.operation))];
        self.registry.record_histogram(
            BIZ_OPERATION_DURATION,
            self.start.elapsed().as_secs_f64(),
            &attributes,
        );
    }
}
