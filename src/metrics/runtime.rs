//! Observable gauges over the tokio runtime the provider was built on.

use opentelemetry::metrics::{Meter, ObservableGauge};
use tokio::runtime::Handle;

use crate::error::InitError;

/// Keeps the runtime gauges registered. Dropping it does not unregister the
/// callbacks; they live as long as the meter provider.
pub struct RuntimeMetrics {
    _gauges: Vec<ObservableGauge<u64>>,
}

impl std::fmt::Debug for RuntimeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeMetrics")
            .field("gauges", &self._gauges.len())
            .finish()
    }
}

/// Register `runtime.tokio.*` gauges on `meter`.
///
/// # Errors
///
/// Fails outside a tokio runtime or if the meter rejects an instrument.
pub fn start_runtime_metrics(meter: &Meter) -> Result<RuntimeMetrics, InitError> {
    let handle = Handle::try_current()?;

    let workers = {
        let handle = handle.clone();
        meter
            .u64_observable_gauge("runtime.tokio.workers")
            .with_description("Number of worker threads used by the runtime")
            .with_unit("{thread}")
            .with_callback(move |observer| {
                observer.observe(to_u64(handle.metrics().num_workers()), &[]);
            })
            .try_init()?
    };

    let alive_tasks = {
        let handle = handle.clone();
        meter
            .u64_observable_gauge("runtime.tokio.alive_tasks")
            .with_description("Number of tasks currently alive in the runtime")
            .with_unit("{task}")
            .with_callback(move |observer| {
                observer.observe(to_u64(handle.metrics().num_alive_tasks()), &[]);
            })
            .try_init()?
    };

    let queue_depth = meter
        .u64_observable_gauge("runtime.tokio.global_queue_depth")
        .with_description("Number of tasks waiting in the global queue")
        .with_unit("{task}")
        .with_callback(move |observer| {
            observer.observe(to_u64(handle.metrics().global_queue_depth()), &[]);
        })
        .try_init()?;

    tracing::info!("Runtime metrics enabled");
    Ok(RuntimeMetrics {
        _gauges: vec![workers, alive_tasks, queue_depth],
    })
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    #[test]
    fn test_requires_runtime() {
        let provider = SdkMeterProvider::default();
        let result = start_runtime_metrics(&provider.meter("runtime-test"));
        assert!(matches!(result, Err(InitError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_registers_inside_runtime() {
        let provider = SdkMeterProvider::default();
        let metrics = start_runtime_metrics(&provider.meter("runtime-test")).unwrap();
        assert_eq!(metrics._gauges.len(), 3);
    }
}
