//! HTTP instrumentation.
//!
//! - [`HttpLayer`]: server middleware for axum or any tower HTTP service
//! - [`HttpClientLayer`]: outbound middleware that propagates the current
//!   trace context into request headers
//!
//! Handlers behind [`HttpLayer`] can read the request's OpenTelemetry
//! context with `Extension<opentelemetry::Context>` and pass it to
//! [`crate::Telemetry::run`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use axum::extract::MatchedPath;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use opentelemetry::trace::{FutureExt as _, SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::logging::filter_stack_trace;
use crate::panic::take_backtrace;
use crate::metrics::names::{
    HTTP_CLIENT_REQUEST_DURATION, HTTP_SERVER_ACTIVE_REQUESTS, HTTP_SERVER_REQUEST_DURATION,
    HTTP_SERVER_REQUEST_TOTAL,
};
use crate::metrics::registry::MetricRegistry;
use crate::run::panic_message;
use crate::telemetry::Telemetry;
use crate::trace::record_exception;

/// Server-side HTTP middleware.
#[derive(Clone, Debug)]
pub struct HttpLayer {
    telemetry: Telemetry,
}

impl HttpLayer {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl<S> Layer<S> for HttpLayer {
    type Service = HttpService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpService {
            inner,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Service produced by [`HttpLayer`].
#[derive(Clone, Debug)]
pub struct HttpService<S> {
    inner: S,
    telemetry: Telemetry,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpService<S>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let telemetry = self.telemetry.clone();

        let method = req.method().as_str().to_string();
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| req.uri().path().to_string(), |p| p.as_str().to_string());

        let parent = telemetry.extract_http(req.headers());
        let cx = telemetry.start_span(
            &parent,
            format!("{method} {route}"),
            SpanKind::Server,
            vec![
                KeyValue::new("http.request.method", method.clone()),
                KeyValue::new("http.route", route.clone()),
                KeyValue::new("url.path", req.uri().path().to_string()),
            ],
        );
        req.extensions_mut().insert(cx.clone());

        let log = {
            let span_context = cx.span().span_context().clone();
            // Error level keeps the fields on events under any level filter.
            tracing::error_span!(
                "http_request",
                method = %method,
                route = %route,
                trace_id = %span_context.trace_id(),
                span_id = %span_context.span_id(),
            )
        };

        let registry = Arc::clone(telemetry.registry());
        let route_attributes = vec![
            KeyValue::new("http.request.method", method),
            KeyValue::new("http.route", route),
        ];
        let active = ActiveRequest::start(Arc::clone(&registry), route_attributes.clone());
        let start = Instant::now();

        Box::pin(async move {
            let _active = active;
            let outcome = AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .instrument(log.clone())
                .with_context(cx.clone())
                .await;

            let span = cx.span();
            let mut panicked = false;
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    let message = e.to_string();
                    record_exception(&span, &message, None);
                    span.set_status(Status::error(message));

                    let mut attributes = route_attributes;
                    attributes.push(KeyValue::new(
                        "error.type",
                        std::any::type_name::<S::Error>(),
                    ));
                    record_request(&registry, &attributes, start);
                    span.end();
                    return Err(e);
                }
                Err(payload) => {
                    panicked = true;
                    let message = panic_message(payload.as_ref());
                    let stack = filter_stack_trace(&take_backtrace(), telemetry.stack_filters());
                    record_exception(&span, &message, Some(&stack));
                    span.set_status(Status::error("panic occurred"));
                    log.in_scope(|| {
                        tracing::error!(panic = %message, stack = %stack, "HTTP handler panic recovered");
                    });

                    let mut response = Response::new(ResBody::default());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    response
                }
            };

            let status = response.status().as_u16();
            span.set_attribute(KeyValue::new("http.response.status_code", i64::from(status)));
            if status >= 500 && !panicked {
                span.set_status(Status::error(format!("HTTP {status}")));
            }

            let mut attributes = route_attributes;
            attributes.push(KeyValue::new("http.response.status_code", i64::from(status)));
            record_request(&registry, &attributes, start);

            span.end();
            Ok(response)
        })
    }
}

fn record_request(registry: &MetricRegistry, attributes: &[KeyValue], start: Instant) {
    registry.add_counter(HTTP_SERVER_REQUEST_TOTAL, 1, attributes);
    registry.record_histogram(
        HTTP_SERVER_REQUEST_DURATION,
        start.elapsed().as_secs_f64(),
        attributes,
    );
}

/// Counts a request in `http.server.active_requests` until dropped.
struct ActiveRequest {
    registry: Arc<MetricRegistry>,
    attributes: Vec<KeyValue>,
}

impl ActiveRequest {
    fn start(registry: Arc<MetricRegistry>, attributes: Vec<KeyValue>) -> Self {
        registry.add_up_down_counter(HTTP_SERVER_ACTIVE_REQUESTS, 1, &attributes);
        Self {
            registry,
            attributes,
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.registry
            .add_up_down_counter(HTTP_SERVER_ACTIVE_REQUESTS, -1, &self.attributes);
    }
}

/// Client-side HTTP middleware.
///
/// The parent span is the `opentelemetry::Context` in the request
/// extensions, or the current context when there is none.
#[derive(Clone, Debug)]
pub struct HttpClientLayer {
    telemetry: Telemetry,
}

impl HttpClientLayer {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }
}

impl<S> Layer<S> for HttpClientLayer {
    type Service = HttpClientService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpClientService {
            inner,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Service produced by [`HttpClientLayer`].
#[derive(Clone, Debug)]
pub struct HttpClientService<S> {
    inner: S,
    telemetry: Telemetry,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpClientService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let parent = req
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(Context::current);

        let method = req.method().as_str().to_string();
        let host = req.uri().host().unwrap_or_default().to_string();
        let cx = self.telemetry.start_span(
            &parent,
            method.clone(),
            SpanKind::Client,
            vec![
                KeyValue::new("http.request.method", method.clone()),
                KeyValue::new("url.full", req.uri().to_string()),
                KeyValue::new("server.address", host.clone()),
            ],
        );
        self.telemetry.inject_http(&cx, req.headers_mut());

        let registry = Arc::clone(self.telemetry.registry());
        let start = Instant::now();
        let future = self.inner.call(req);

        Box::pin(async move {
            let result = future.with_context(cx.clone()).await;

            let span = cx.span();
            let mut attributes = vec![
                KeyValue::new("http.request.method", method),
                KeyValue::new("server.address", host),
            ];
            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    span.set_attribute(KeyValue::new("http.response.status_code", i64::from(status)));
                    attributes.push(KeyValue::new("http.response.status_code", i64::from(status)));
                    if status >= 400 {
                        span.set_status(Status::error(format!("HTTP {status}")));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    record_exception(&span, &message, None);
                    span.set_status(Status::error(message));
                }
            }

            registry.record_histogram(
                HTTP_CLIENT_REQUEST_DURATION,
                start.elapsed().as_secs_f64(),
                &attributes,
            );
            span.end();
            result
        })
    }
}
