//! Order service instrumented with o11y.
//!
//! # Usage
//!
//! ```bash
//! o11y-demo --listen 0.0.0.0:8080 --metric-exporter prometheus
//! curl localhost:8080/hello
//! curl -X POST localhost:8080/orders/book -H 'x-tenant: acme'
//! curl localhost:2222/metrics
//! ```

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use clap::Parser;
use o11y::http::HttpLayer;
use o11y::sql::{register_pool_metrics, SqlInstrumentation};
use o11y::{Provider, Telemetry};
use opentelemetry::baggage::BaggageExt;
use opentelemetry::{Context, KeyValue};
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::Args;

type Pool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Clone)]
struct AppState {
    telemetry: Telemetry,
    sql: Arc<SqlInstrumentation>,
    pool: Pool,
}

/// Handler error rendered as a 500.
struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

async fn hello(
    State(app): State<AppState>,
    Extension(cx): Extension<Context>,
) -> Result<String, AppError> {
    let greeting = app
        .telemetry
        .run(&cx, "SayHello", |_cx, state| async move {
            state.add_event("greeting.built", Vec::new());
            Ok::<_, anyhow::Error>(format!(
                "hello, trace {}",
                state.trace_id().unwrap_or_default()
            ))
        })
        .await?;
    Ok(greeting)
}

async fn explode(
    State(app): State<AppState>,
    Extension(cx): Extension<Context>,
) -> Result<String, AppError> {
    let value = app
        .telemetry
        .run(&cx, "Explode", |_cx, _state| async move {
            let slots: Vec<u32> = Vec::new();
            Ok::<_, anyhow::Error>(slots[std::hint::black_box(1)])
        })
        .await?;
    Ok(value.to_string())
}

async fn create_order(
    State(app): State<AppState>,
    Extension(cx): Extension<Context>,
    Path(item): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, String), AppError> {
    let tenant = headers
        .get("x-tenant")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();
    let telemetry = app.telemetry.clone();
    let (pool, sql) = (app.pool.clone(), Arc::clone(&app.sql));

    let id = app
        .telemetry
        .run(&cx, "CreateOrder", |cx, state| async move {
            let cx = state.set_baggage(&cx, "tenant", &tenant);
            state.set_attributes(vec![KeyValue::new("order.item", item.clone())]);

            telemetry
                .run(&cx, "PersistOrder", |cx, state| async move {
                    let tenant = cx
                        .baggage()
                        .get("tenant")
                        .map(|v| v.as_str().into_owned())
                        .unwrap_or_default();
                    let owner = tenant.clone();
                    let id = tokio::task::spawn_blocking(move || {
                        let conn = pool.get()?;
                        sql.execute(
                            &cx,
                            &conn,
                            "INSERT INTO orders (tenant, item) VALUES (?1, ?2)",
                            (&owner, &item),
                        )?;
                        Ok::<_, anyhow::Error>(conn.last_insert_rowid())
                    })
                    .await??;
                    state.inc_counter("demo.orders.created", &[KeyValue::new("tenant", tenant)]);
                    Ok::<_, anyhow::Error>(id)
                })
                .await
        })
        .await?;

    Ok((StatusCode::CREATED, format!("order {id}")))
}

fn open_database() -> anyhow::Result<Pool> {
    let pool = r2d2::Pool::builder()
        .max_size(1)
        // Each in-memory connection is its own database; never recycle it.
        .idle_timeout(None)
        .max_lifetime(None)
        .build(SqliteConnectionManager::memory())
        .context("failed to open the order database")?;
    pool.get()?.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, tenant TEXT NOT NULL, item TEXT NOT NULL)",
    )?;
    Ok(pool)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown..."),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating shutdown..."),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let provider = Provider::new(args.observability())?;
    let telemetry = provider.telemetry();
    if telemetry
        .registry()
        .register_counter("demo.orders.created", "Orders accepted by the demo", "{order}")
        .is_none()
    {
        tracing::warn!("Order counter unavailable, orders will not be counted");
    }

    let pool = open_database()?;
    // The gauges stay registered while this is alive.
    let _pool_metrics = register_pool_metrics(&telemetry, &pool, "orders")?;

    let state = AppState {
        telemetry: telemetry.clone(),
        sql: Arc::new(SqlInstrumentation::new(telemetry.clone(), "sqlite").with_sql_commenter(true)),
        pool,
    };
    let app = Router::new()
        .route("/hello", get(hello))
        .route("/panic", get(explode))
        .route("/orders/:item", post(create_order))
        .layer(HttpLayer::new(telemetry))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(addr = %args.listen, "Demo service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = provider
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await
    {
        eprintln!("observability shutdown incomplete: {e}");
    }
    Ok(())
}
