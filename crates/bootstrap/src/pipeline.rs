//! Shutdown contract shared by the metrics and trace pipelines.

use std::time::Duration;

use async_trait::async_trait;
use common::TelemetryError;
use tracing::{info, warn};

use crate::connection::CollectorConnection;

/// Handle returned by a pipeline builder; flushes and stops the pipeline.
#[async_trait]
pub trait PipelineShutdown: Send + Sync {
    /// Short label used in logs (`"metrics"`, `"traces"`).
    fn name(&self) -> &'static str;

    /// Flush buffered telemetry and stop the background task.
    ///
    /// The first call does the work; later calls return `Ok(())` without side
    /// effects. If `timeout` expires first, the background task is still
    /// stopped and [`TelemetryError::ShutdownTimeout`] is returned.
    async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError>;
}

/// Shut down every pipeline, then close `connection`.
///
/// A failing pipeline does not stop the others from being shut down. The
/// first error encountered is returned after the connection is closed.
pub async fn shutdown_all<C>(
    pipelines: &[&dyn PipelineShutdown],
    connection: CollectorConnection<C>,
    timeout: Duration,
) -> Result<(), TelemetryError> {
    let mut first_error = None;
    for pipeline in pipelines {
        match pipeline.shutdown(timeout).await {
            Ok(()) => info!(pipeline = pipeline.name(), "telemetry pipeline shut down"),
            Err(e) => {
                warn!(pipeline = pipeline.name(), error = %e, "telemetry pipeline shutdown failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Err(e) = connection.close() {
        first_error.get_or_insert(e);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Pipelines spawn their background tasks on the ambient Tokio runtime.
pub(crate) fn ensure_runtime() -> Result<(), TelemetryError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| TelemetryError::config("pipelines must be built from within a Tokio runtime"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recording {
        name: &'static str,
        fail: bool,
        order: Arc<AtomicUsize>,
        seen_at: AtomicUsize,
    }

    #[async_trait]
    impl PipelineShutdown for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn shutdown(&self, _timeout: Duration) -> Result<(), TelemetryError> {
            let at = self.order.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen_at.store(at, Ordering::SeqCst);
            if self.fail {
                Err(TelemetryError::Shutdown(format!("{} failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn recording(name: &'static str, fail: bool, order: &Arc<AtomicUsize>) -> Recording {
        Recording {
            name,
            fail,
            order: Arc::clone(order),
            seen_at: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn shuts_down_in_order_then_closes() {
        let order = Arc::new(AtomicUsize::new(0));
        let metrics = recording("metrics", false, &order);
        let traces = recording("traces", false, &order);
        let conn = CollectorConnection::new("collector:4317", ());

        shutdown_all(&[&metrics, &traces], conn, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(metrics.seen_at.load(Ordering::SeqCst), 1);
        assert_eq!(traces.seen_at.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_does_not_skip_remaining_pipelines() {
        let order = Arc::new(AtomicUsize::new(0));
        let metrics = recording("metrics", true, &order);
        let traces = recording("traces", false, &order);
        let conn = CollectorConnection::new("collector:4317", ());

        let err = shutdown_all(&[&metrics, &traces], conn, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("metrics failed"));
        assert_eq!(traces.seen_at.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn live_lease_is_reported_on_close() {
        let conn = CollectorConnection::new("collector:4317", ());
        let _lease = conn.lease();
        let err = shutdown_all(&[], conn, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::ConnectionInUse(1)));
    }

    #[test]
    fn runtime_is_required() {
        assert!(ensure_runtime().unwrap_err().is_configuration());
    }
}
