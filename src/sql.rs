//! SQL instrumentation for `rusqlite` connections and `r2d2` pools.
//!
//! [`SqlInstrumentation`] runs each statement inside a client span and
//! records `db.client.query.duration`. With the SQL commenter enabled the
//! statement carries the caller's `traceparent` so database logs can be
//! joined with traces.

use std::fmt;
use std::time::Instant;

use opentelemetry::metrics::ObservableGauge;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use rusqlite::{Connection, Params, Row};

use crate::error::InitError;
use crate::metrics::names::DB_CLIENT_QUERY_DURATION;
use crate::telemetry::Telemetry;
use crate::trace::record_exception;

/// Statement wrapper for one database system.
#[derive(Clone, Debug)]
pub struct SqlInstrumentation {
    telemetry: Telemetry,
    system: String,
    sql_commenter: bool,
}

impl SqlInstrumentation {
    /// # Arguments
    ///
    /// * `telemetry` - Handle the spans and metrics are recorded on
    /// * `system` - Reported as `db.system`, e.g. `sqlite`
    pub fn new(telemetry: Telemetry, system: impl Into<String>) -> Self {
        Self {
            telemetry,
            system: system.into(),
            sql_commenter: false,
        }
    }

    /// Append a `traceparent` comment to every statement.
    #[must_use]
    pub fn with_sql_commenter(mut self, enabled: bool) -> Self {
        self.sql_commenter = enabled;
        self
    }

    /// Run `f` with the (possibly commented) statement inside a client span.
    pub fn observe<T, E, F>(&self, cx: &Context, sql: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&str) -> Result<T, E>,
        E: fmt::Display,
    {
        let operation = sql_operation(sql);
        let span_name = if operation.is_empty() {
            self.system.clone()
        } else {
            operation.clone()
        };

        let cx = self.telemetry.start_span(
            cx,
            span_name,
            SpanKind::Client,
            vec![
                KeyValue::new("db.system", self.system.clone()),
                KeyValue::new("db.operation", operation.clone()),
                KeyValue::new("db.query.text", sql.to_string()),
            ],
        );

        let statement = if self.sql_commenter {
            format!("{sql} {}", sql_comment(&cx))
        } else {
            sql.to_string()
        };

        let start = Instant::now();
        let result = f(&statement);
        let elapsed = start.elapsed();

        let span = cx.span();
        let mut attributes = vec![
            KeyValue::new("db.system", self.system.clone()),
            KeyValue::new("db.operation", operation),
        ];
        if let Err(e) = &result {
            let message = e.to_string();
            record_exception(&span, &message, None);
            span.set_status(Status::error(message));
            attributes.push(KeyValue::new("error.type", "query_failed"));
            tracing::debug!(error = %e, sql, "SQL statement failed");
        }

        self.telemetry.registry().record_histogram(
            DB_CLIENT_QUERY_DURATION,
            elapsed.as_secs_f64(),
            &attributes,
        );
        span.end();
        result
    }

    /// Instrumented [`Connection::execute`].
    pub fn execute<P: Params>(
        &self,
        cx: &Context,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> rusqlite::Result<usize> {
        self.observe(cx, sql, |statement| conn.execute(statement, params))
    }

    /// Instrumented [`Connection::query_row`].
    pub fn query_row<T, P, F>(
        &self,
        cx: &Context,
        conn: &Connection,
        sql: &str,
        params: P,
        f: F,
    ) -> rusqlite::Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.observe(cx, sql, |statement| conn.query_row(statement, params, f))
    }

    /// Prepare `sql` and collect every mapped row.
    pub fn query_map<T, P, F>(
        &self,
        cx: &Context,
        conn: &Connection,
        sql: &str,
        params: P,
        f: F,
    ) -> rusqlite::Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.observe(cx, sql, |statement| {
            let mut stmt = conn.prepare(statement)?;
            let rows = stmt.query_map(params, f)?;
            rows.collect()
        })
    }
}

/// Leading keyword of a statement, uppercased.
fn sql_operation(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// SQL commenter comment carrying the span in `cx`; empty without a valid span.
pub fn sql_comment(cx: &Context) -> String {
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return String::new();
    }
    format!(
        "/*traceparent='00-{}-{}-{:02x}'*/",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    )
}

/// Keeps the pool gauges registered.
pub struct PoolMetrics {
    _gauges: Vec<ObservableGauge<u64>>,
}

impl fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolMetrics")
            .field("gauges", &self._gauges.len())
            .finish()
    }
}

/// Publish connection pool gauges tagged with `db.instance.id`.
///
/// # Arguments
///
/// * `telemetry` - Handle whose meter the gauges are created on
/// * `pool` - The pool to observe
/// * `instance` - Logical name of the database instance, e.g. `primary`
pub fn register_pool_metrics<M>(
    telemetry: &Telemetry,
    pool: &r2d2::Pool<M>,
    instance: &str,
) -> Result<PoolMetrics, InitError>
where
    M: r2d2::ManageConnection,
{
    tracing::info!(db_instance = instance, "Registering database connection pool metrics");

    let attributes = vec![KeyValue::new("db.instance.id", instance.to_string())];
    let meter = telemetry.meter();

    let connections = {
        let pool = pool.clone();
        let attributes = attributes.clone();
        meter
            .u64_observable_gauge("db.client.connection.count")
            .with_description("Number of open connections in the pool")
            .with_unit("{connection}")
            .with_callback(move |observer| {
                observer.observe(u64::from(pool.state().connections), &attributes);
            })
            .try_init()
    };
    let idle = {
        let pool = pool.clone();
        let attributes = attributes.clone();
        meter
            .u64_observable_gauge("db.client.connection.idle")
            .with_description("Number of idle connections in the pool")
            .with_unit("{connection}")
            .with_callback(move |observer| {
                observer.observe(u64::from(pool.state().idle_connections), &attributes);
            })
            .try_init()
    };
    let max = {
        let pool = pool.clone();
        meter
            .u64_observable_gauge("db.client.connection.max")
            .with_description("Maximum number of connections allowed in the pool")
            .with_unit("{connection}")
            .with_callback(move |observer| {
                observer.observe(u64::from(pool.max_size()), &attributes);
            })
            .try_init()
    };

    let gauges = [connections, idle, max]
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            tracing::error!(
                db_instance = instance,
                error = %e,
                "Failed to register database connection pool metrics"
            );
            InitError::from(e)
        })?;

    Ok(PoolMetrics { _gauges: gauges })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_operation() {
        assert_eq!(sql_operation("  select * from t"), "SELECT");
        assert_eq!(sql_operation("INSERT INTO t VALUES (1)"), "INSERT");
        assert_eq!(sql_operation(""), "");
    }

    #[test]
    fn test_sql_comment_without_span_is_empty() {
        assert_eq!(sql_comment(&Context::new()), "");
    }
}
