//! HTTP endpoint for metrics scraping.
//!
//! Provides:
//! - the configured metrics path - Prometheus text rendering of the meter
//!   provider's metrics, labels and histogram buckets included
//! - `/health` - Basic health check
//! - `/ready` - Readiness check

use std::net::SocketAddr;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;

use crate::error::InitError;
use crate::provider::ShutdownFn;

/// Metrics server state.
#[derive(Clone)]
pub struct MetricsState {
    registry: Registry,
}

impl MetricsState {
    /// `registry` is the one the OpenTelemetry Prometheus exporter writes to.
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

/// Create the metrics HTTP router serving the registry at `path`.
pub fn create_router(state: MetricsState, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8".to_string())],
                format!("Failed to encode metrics: {e}").into_bytes(),
            )
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, "READY")
}

/// Parse a listen address; `:port` binds every interface.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, InitError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse().map_err(|source| InitError::InvalidAddress {
        addr: addr.to_string(),
        source,
    })
}

/// Bind `addr` and serve `registry` at `path` on the current tokio runtime.
///
/// Binding happens before this returns so address conflicts fail
/// initialization. The returned shutdown stops the server gracefully.
///
/// # Errors
///
/// Returns an error if the address is invalid, cannot be bound, or no
/// runtime is available.
pub fn serve_metrics(
    addr: &str,
    path: &str,
    registry: Registry,
) -> Result<ShutdownFn, InitError> {
    let socket_addr = parse_listen_addr(addr)?;
    let bind_error = |source| InitError::MetricsServer {
        addr: addr.to_string(),
        source,
    };

    let runtime = tokio::runtime::Handle::try_current()?;
    let std_listener = std::net::TcpListener::bind(socket_addr).map_err(bind_error)?;
    std_listener.set_nonblocking(true).map_err(bind_error)?;
    let listener = {
        let _entered = runtime.enter();
        tokio::net::TcpListener::from_std(std_listener).map_err(bind_error)?
    };

    let app = create_router(MetricsState::new(registry), path);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tracing::info!(address = %socket_addr, path, "Starting metrics server");
    runtime.spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
                tracing::info!("Metrics server shutting down");
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    Ok(ShutdownFn::new(move || {
        let _ = shutdown_tx.send(true);
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use tower::ServiceExt;

    use crate::metrics::registry::MetricRegistry;

    fn router() -> (SdkMeterProvider, MetricRegistry, Router) {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let metrics = MetricRegistry::new(provider.meter("server-test"));
        let app = create_router(MetricsState::new(registry), "/metrics");
        (provider, metrics, app)
    }

    async fn scrape(app: Router) -> String {
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_provider, _metrics, app) = router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let (_provider, _metrics, app) = router();

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_keeps_labels() {
        let (_provider, metrics, app) = router();
        metrics.register_counter("biz.operation.error.total", "Errors", "{error}");
        metrics.add_counter(
            "biz.operation.error.total",
            1,
            &[KeyValue::new("operation", "A")],
        );
        metrics.add_counter(
            "biz.operation.error.total",
            2,
            &[KeyValue::new("operation", "B")],
        );

        let text = scrape(app).await;
        let series: Vec<&str> = text
            .lines()
            .filter(|line| line.starts_with("biz_operation_error_total"))
            .collect();
        assert!(
            series
                .iter()
                .any(|line| line.contains(r#"operation="A""#) && line.ends_with(" 1")),
            "{text}"
        );
        assert!(
            series
                .iter()
                .any(|line| line.contains(r#"operation="B""#) && line.ends_with(" 2")),
            "{text}"
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_histogram_buckets() {
        let (_provider, metrics, app) = router();
        metrics.register_histogram("biz.operation.duration", "Duration", "s");
        metrics.register_up_down_counter("http.server.active_requests", "", "{request}");
        metrics.record_histogram(
            "biz.operation.duration",
            0.5,
            &[KeyValue::new("operation", "A")],
        );
        metrics.add_up_down_counter("http.server.active_requests", 2, &[]);

        let text = scrape(app).await;
        assert!(text.contains("biz_operation_duration_seconds_bucket"), "{text}");
        assert!(text.contains(r#"le="+Inf""#), "{text}");
        assert!(text.contains("biz_operation_duration_seconds_count"), "{text}");
        assert!(text.contains("http_server_active_requests"), "{text}");
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr(":2222").unwrap(),
            "0.0.0.0:2222".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("127.0.0.1:9090").is_ok());
        assert!(matches!(
            parse_listen_addr("not an address"),
            Err(InitError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_serve_metrics_rejects_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = serve_metrics(&addr, "/metrics", Registry::new());
        assert!(matches!(result, Err(InitError::MetricsServer { .. })));
    }
}
