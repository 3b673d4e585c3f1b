//! gRPC layer and interceptor tests.

mod common;

use std::convert::Infallible;

use common::{is_error, span_attribute, TestTelemetry};
use http::{Request, Response};
use o11y::grpc::{GrpcClientInterceptor, GrpcLayer};
use o11y::metrics::names::{RPC_SERVER_DURATION, RPC_SERVER_PANIC_TOTAL};
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::Context;
use tonic::service::Interceptor;
use tower::{Layer, ServiceExt};

fn grpc_request(path: &str) -> Request<String> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/grpc")
        .body(String::new())
        .unwrap()
}

fn respond_with(code: &'static str) -> Response<String> {
    Response::builder()
        .header("content-type", "application/grpc")
        .header("grpc-status", code)
        .body(String::new())
        .unwrap()
}

#[tokio::test]
async fn test_successful_call() {
    let t = TestTelemetry::new();
    let service = GrpcLayer::new(t.telemetry.clone()).layer(tower::service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(respond_with("0")) },
    ));

    let response = service
        .oneshot(grpc_request("/shop.OrderService/GetOrder"))
        .await
        .unwrap();

    assert_eq!(response.headers()["grpc-status"], "0");
    let span = t.span("shop.OrderService/GetOrder");
    assert_eq!(span.span_kind, SpanKind::Server);
    assert_eq!(
        span_attribute(&span, "rpc.service").as_deref(),
        Some("shop.OrderService")
    );
    assert_eq!(span_attribute(&span, "rpc.method").as_deref(), Some("GetOrder"));
    assert!(!is_error(&span));
    assert_eq!(t.telemetry.registry().sample_count(RPC_SERVER_DURATION), 1);
}

#[tokio::test]
async fn test_server_error_code_marks_span() {
    let t = TestTelemetry::new();
    let service = GrpcLayer::new(t.telemetry.clone()).layer(tower::service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(respond_with("14")) },
    ));

    service
        .oneshot(grpc_request("/shop.OrderService/GetOrder"))
        .await
        .unwrap();

    assert!(is_error(&t.span("shop.OrderService/GetOrder")));
}

#[tokio::test]
async fn test_client_error_code_keeps_span_ok() {
    let t = TestTelemetry::new();
    let service = GrpcLayer::new(t.telemetry.clone()).layer(tower::service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(respond_with("5")) },
    ));

    service
        .oneshot(grpc_request("/shop.OrderService/GetOrder"))
        .await
        .unwrap();

    let span = t.span("shop.OrderService/GetOrder");
    assert!(!is_error(&span));
    assert_eq!(
        span_attribute(&span, "rpc.grpc.status_code").as_deref(),
        Some("5")
    );
}

#[tokio::test]
async fn test_panic_returns_internal() {
    let t = TestTelemetry::new();
    let service = GrpcLayer::new(t.telemetry.clone()).layer(tower::service_fn(
        |_req: Request<String>| async {
            let orders: Vec<u32> = Vec::new();
            let first = std::hint::black_box(&orders)[0];
            Ok::<_, Infallible>(respond_with(if first == 0 { "0" } else { "2" }))
        },
    ));

    let response = service
        .oneshot(grpc_request("/shop.OrderService/CreateOrder"))
        .await
        .unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.headers()["grpc-status"], "13");
    assert_eq!(
        response.headers()["grpc-message"],
        "Internal%20Server%20Error"
    );

    let span = t.span("shop.OrderService/CreateOrder");
    assert!(is_error(&span));
    assert!(common::event_attribute(&span, "exception", "exception.stacktrace").is_some());

    let registry = t.telemetry.registry();
    assert_eq!(registry.value(RPC_SERVER_PANIC_TOTAL), 1);
    assert_eq!(registry.sample_count(RPC_SERVER_DURATION), 1);
}

#[tokio::test]
async fn test_incoming_metadata_parents_span() {
    let t = TestTelemetry::new();
    let service = GrpcLayer::new(t.telemetry.clone()).layer(tower::service_fn(
        |_req: Request<String>| async { Ok::<_, Infallible>(respond_with("0")) },
    ));
    let mut request = grpc_request("/shop.OrderService/GetOrder");
    request.headers_mut().insert(
        "traceparent",
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            .parse()
            .unwrap(),
    );

    service.oneshot(request).await.unwrap();

    let span = t.span("shop.OrderService/GetOrder");
    assert_eq!(
        span.span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
}

#[test]
fn test_interceptor_injects_context_from_extensions() {
    let t = TestTelemetry::new();
    let cx = t
        .telemetry
        .start_span(&Context::new(), "caller", SpanKind::Internal, Vec::new());
    let trace_id = cx.span().span_context().trace_id().to_string();

    let mut request = tonic::Request::new(());
    request.extensions_mut().insert(cx);
    let request = GrpcClientInterceptor::new(t.telemetry.clone())
        .call(request)
        .unwrap();

    let traceparent = request
        .metadata()
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(traceparent.contains(&trace_id));
}

#[test]
fn test_interceptor_without_span_adds_nothing() {
    let t = TestTelemetry::new();

    let request = GrpcClientInterceptor::new(t.telemetry.clone())
        .call(tonic::Request::new(()))
        .unwrap();

    assert!(request.metadata().get("traceparent").is_none());
}
