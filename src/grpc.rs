//! gRPC instrumentation for tonic.
//!
//! - [`GrpcLayer`]: server layer, `Server::builder().layer(GrpcLayer::new(telemetry))`
//! - [`GrpcClientInterceptor`]: injects the current trace context into
//!   outgoing request metadata

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use opentelemetry::trace::{FutureExt as _, SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use tonic::service::Interceptor;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::logging::filter_stack_trace;
use crate::panic::take_backtrace;
use crate::metrics::names::{RPC_SERVER_DURATION, RPC_SERVER_PANIC_TOTAL};
use crate::run::panic_message;
use crate::telemetry::Telemetry;
use crate::trace::record_exception;

/// `grpc-status` of a cancelled call.
const CODE_CANCELLED: i32 = 1;

/// `grpc-status` returned for a recovered panic.
const CODE_INTERNAL: i32 = 13;

/// Codes that mark a server span as failed: Unknown, DeadlineExceeded,
/// Unimplemented, Internal, Unavailable, DataLoss.
const SERVER_ERROR_CODES: &[i32] = &[2, 4, 12, 13, 14, 15];

/// Server-side gRPC middleware.
#[derive(Clone, Debug)]
pub struct GrpcLayer {
    telemetry: Telemetry,
}

impl GrpcLayer {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl<S> Layer<S> for GrpcLayer {
    type Service = GrpcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcService {
            inner,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Service produced by [`GrpcLayer`].
#[derive(Clone, Debug)]
pub struct GrpcService<S> {
    inner: S,
    telemetry: Telemetry,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let telemetry = self.telemetry.clone();

        let full_method = req.uri().path().to_string();
        let (service, method) = split_method(&full_method);

        let parent = telemetry.extract_http(req.headers());
        let cx = telemetry.start_span(
            &parent,
            full_method.trim_start_matches('/').to_string(),
            SpanKind::Server,
            vec![
                KeyValue::new("rpc.system", "grpc"),
                KeyValue::new("rpc.service", service.to_string()),
                KeyValue::new("rpc.method", method.to_string()),
            ],
        );

        let log = {
            let span_context = cx.span().span_context().clone();
            // Error level keeps the fields on events under any level filter.
            tracing::error_span!(
                "grpc_request",
                rpc_method = %full_method,
                trace_id = %span_context.trace_id(),
                span_id = %span_context.span_id(),
            )
        };
        let start = Instant::now();

        Box::pin(async move {
            let registry = Arc::clone(telemetry.registry());
            let method_attribute = KeyValue::new("rpc.method", full_method.clone());

            let outcome = AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .instrument(log.clone())
                .with_context(cx.clone())
                .await;

            let span = cx.span();
            let (result, code) = match outcome {
                Ok(Ok(response)) => {
                    let code = grpc_status(response.headers());
                    (Ok(response), code)
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    record_exception(&span, &message, None);
                    span.set_status(Status::error(message));
                    log.in_scope(|| tracing::error!(error = %e, "gRPC transport failed"));
                    span.end();
                    return Err(e);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let stack = filter_stack_trace(&take_backtrace(), telemetry.stack_filters());
                    record_exception(&span, &format!("panic: {message}"), Some(&stack));
                    span.set_status(Status::error(format!("panic: {message}")));
                    log.in_scope(|| {
                        tracing::error!(panic = %message, stack = %stack, "gRPC server panic recovered");
                    });
                    registry.add_counter(
                        RPC_SERVER_PANIC_TOTAL,
                        1,
                        std::slice::from_ref(&method_attribute),
                    );
                    (Ok(internal_error_response()), CODE_INTERNAL)
                }
            };

            let elapsed = start.elapsed();
            span.set_attribute(KeyValue::new("rpc.grpc.status_code", i64::from(code)));
            if SERVER_ERROR_CODES.contains(&code) {
                span.set_status(Status::error(format!("grpc-status {code}")));
            }
            log.in_scope(|| {
                if code == 0 {
                    tracing::debug!(duration_ms = elapsed.as_millis() as u64, "gRPC execution success");
                } else if code != CODE_CANCELLED {
                    tracing::error!(
                        grpc_status = code,
                        duration_ms = elapsed.as_millis() as u64,
                        "gRPC execution failed"
                    );
                }
            });

            registry.record_histogram(
                RPC_SERVER_DURATION,
                elapsed.as_secs_f64(),
                &[
                    method_attribute,
                    KeyValue::new("rpc.grpc.status_code", i64::from(code)),
                ],
            );
            span.end();
            result
        })
    }
}

/// Split `/package.Service/Method` into service and method.
fn split_method(path: &str) -> (&str, &str) {
    path.trim_start_matches('/')
        .split_once('/')
        .unwrap_or(("", path))
}

/// `grpc-status` of a trailers-only response; 0 when absent.
fn grpc_status(headers: &HeaderMap) -> i32 {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Trailers-only `INTERNAL` response.
fn internal_error_response<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from(CODE_INTERNAL));
    headers.insert(
        "grpc-message",
        HeaderValue::from_static("Internal%20Server%20Error"),
    );
    response
}

/// tonic interceptor injecting the current trace context into request
/// metadata.
///
/// ```no_run
/// # fn example(channel: tonic::transport::Channel, telemetry: o11y::Telemetry) {
/// use o11y::grpc::GrpcClientInterceptor;
/// use tonic::service::interceptor::InterceptedService;
///
/// let channel = InterceptedService::new(channel, GrpcClientInterceptor::new(telemetry));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct GrpcClientInterceptor {
    telemetry: Telemetry,
}

impl GrpcClientInterceptor {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl Interceptor for GrpcClientInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let cx = request
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(Context::current);
        self.telemetry.inject_metadata(&cx, request.metadata_mut());
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_method() {
        assert_eq!(
            split_method("/orders.v1.OrderService/Create"),
            ("orders.v1.OrderService", "Create")
        );
        assert_eq!(split_method("/health"), ("", "/health"));
    }

    #[test]
    fn test_grpc_status_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(grpc_status(&headers), 0);
        headers.insert("grpc-status", HeaderValue::from_static("14"));
        assert_eq!(grpc_status(&headers), 14);
    }

    #[test]
    fn test_internal_error_response() {
        let response: Response<String> = internal_error_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(grpc_status(response.headers()), CODE_INTERNAL);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/grpc"
        );
    }
}
