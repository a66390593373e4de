//! Periodic OTLP metrics pipeline.
//!
//! # Lifecycle
//!
//! 1. [`build_metrics_pipeline`] validates the config, leases the collector
//!    connection and builds an OTLP/gRPC exporter on it.
//! 2. A [`PeriodicReader`] task collects and exports every `collect_period`;
//!    each cycle is cut off after `export_timeout` and the next cycle runs on
//!    schedule regardless.
//! 3. The provider is installed in the [`TelemetryRegistry`].
//! 4. [`MetricsPipeline::shutdown`] exports what is pending, stops the reader,
//!    resets the registry slot and returns the lease. The lease is returned
//!    when the reader has actually stopped, even if the caller's timeout
//!    fired first.
//!
//! Temporality is cumulative for every instrument kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use common::{ResourceDescriptor, TelemetryError};
use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::exporter::PushMetricsExporter;
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use tracing::{debug, info, warn};

use crate::connection::{CollectorConnection, ConnectionLease};
use crate::pipeline::{ensure_runtime, PipelineShutdown};
use crate::registry::TelemetryRegistry;
use crate::resource;

/// Shortest accepted collection period.
pub const MIN_COLLECT_PERIOD: Duration = Duration::from_secs(1);

/// Default collection period.
pub const DEFAULT_COLLECT_PERIOD: Duration = Duration::from_secs(30);

/// Default bound on a single collect-and-export cycle.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

const EXPORTER_LABEL: &str = "grpc";

/// Settings for [`build_metrics_pipeline`].
#[derive(Debug, Clone)]
pub struct MetricsPipelineConfig {
    pub collect_period: Duration,
    pub export_timeout: Duration,
    pub resource: ResourceDescriptor,
}

impl MetricsPipelineConfig {
    pub fn new(resource: ResourceDescriptor) -> Self {
        Self {
            collect_period: DEFAULT_COLLECT_PERIOD,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            resource,
        }
    }

    pub fn with_collect_period(mut self, period: Duration) -> Self {
        self.collect_period = period;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Sub-second periods are rejected rather than clamped.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.collect_period < MIN_COLLECT_PERIOD {
            return Err(TelemetryError::config(format!(
                "collect period {:?} is shorter than {:?}; choose a longer period to avoid overloading the collector",
                self.collect_period, MIN_COLLECT_PERIOD
            )));
        }
        if self.export_timeout.is_zero() {
            return Err(TelemetryError::config("metrics export timeout must be > 0"));
        }
        self.resource.validate()
    }
}

/// Running metrics pipeline. Dropping it does not stop the reader; call
/// [`PipelineShutdown::shutdown`].
#[derive(Debug)]
pub struct MetricsPipeline {
    provider: Arc<SdkMeterProvider>,
    registry: TelemetryRegistry,
    lease: ArcSwapOption<ConnectionLease>,
    shut_down: AtomicBool,
}

/// Build the periodic OTLP metrics pipeline on `connection` and install it in `registry`.
///
/// # Errors
///
/// - [`TelemetryError::Configuration`] if the config is invalid or no Tokio
///   runtime is available. The connection is not touched.
/// - [`TelemetryError::ExporterConstruction`] if the OTLP exporter cannot be
///   built. Nothing is installed; the registry keeps its previous provider.
pub fn build_metrics_pipeline(
    connection: &CollectorConnection,
    config: &MetricsPipelineConfig,
    registry: &TelemetryRegistry,
) -> Result<MetricsPipeline, TelemetryError> {
    config.validate()?;
    ensure_runtime()?;

    let lease = connection.lease();
    let exporter = MetricsExporterBuilder::from(
        opentelemetry_otlp::new_exporter()
            .tonic()
            .with_channel(lease.channel().clone())
            .with_timeout(config.export_timeout),
    )
    .build_metrics_exporter(
        Box::new(DefaultTemporalitySelector::new()),
        Box::new(DefaultAggregationSelector::new()),
    )
    .map_err(|e| TelemetryError::ExporterConstruction(format!("OTLP metrics exporter: {e}")))?;

    info!(
        endpoint = connection.endpoint(),
        collect_period = ?config.collect_period,
        service = %config.resource.service_name,
        "metrics pipeline installed"
    );
    Ok(install(exporter, config, registry, Some(lease)))
}

/// Wire `exporter` into a periodic reader and install the resulting provider.
pub(crate) fn install<E: PushMetricsExporter>(
    exporter: E,
    config: &MetricsPipelineConfig,
    registry: &TelemetryRegistry,
    lease: Option<ConnectionLease>,
) -> MetricsPipeline {
    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(config.collect_period)
        .with_timeout(config.export_timeout)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource::merged(&config.resource, EXPORTER_LABEL))
        .build();

    MetricsPipeline {
        provider: registry.install_meter_provider(provider),
        registry: registry.clone(),
        lease: ArcSwapOption::from_pointee(lease),
        shut_down: AtomicBool::new(false),
    }
}

impl MetricsPipeline {
    /// The provider this pipeline installed.
    pub fn provider(&self) -> Arc<SdkMeterProvider> {
        Arc::clone(&self.provider)
    }

    /// Collect and export immediately, outside the periodic schedule.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), TelemetryError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TelemetryError::Shutdown("metrics pipeline is shut down".into()));
        }
        let provider = Arc::clone(&self.provider);
        // The SDK blocks the calling thread until the reader task answers.
        let flush = tokio::task::spawn_blocking(move || provider.force_flush());
        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TelemetryError::ExportCycle(e.to_string())),
            Ok(Err(join)) => Err(TelemetryError::ExportCycle(join.to_string())),
            Err(_) => Err(TelemetryError::ShutdownTimeout(timeout)),
        }
    }
}

#[async_trait]
impl PipelineShutdown for MetricsPipeline {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("metrics pipeline already shut down");
            return Ok(());
        }

        // New instruments resolve to the inert provider from here on.
        self.registry.release_meter_provider(&self.provider);

        let provider = Arc::clone(&self.provider);
        // Runs to completion even if the timeout below fires, so the reader
        // task always stops. The lease is held until then: the final export
        // still goes over the channel.
        let lease = self.lease.swap(None);
        let stop = tokio::task::spawn_blocking(move || {
            let result = provider.shutdown();
            drop(lease);
            result
        });
        match tokio::time::timeout(timeout, stop).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TelemetryError::Shutdown(format!("metrics: {e}"))),
            Ok(Err(join)) => Err(TelemetryError::Shutdown(format!("metrics: {join}"))),
            Err(_) => {
                warn!(?timeout, "metrics shutdown timed out; reader stops in the background");
                Err(TelemetryError::ShutdownTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::Result as MetricsResult;
    use opentelemetry::{Key, Value};
    use opentelemetry_sdk::metrics::data::{ResourceMetrics, Temporality};
    use opentelemetry_sdk::metrics::reader::{AggregationSelector, TemporalitySelector};
    use opentelemetry_sdk::metrics::{Aggregation, InstrumentKind};
    use opentelemetry_sdk::testing::metrics::InMemoryMetricsExporter;
    use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
    use tonic::transport::Endpoint;

    fn lazy_connection() -> CollectorConnection {
        let channel = Endpoint::from_static("http://127.0.0.1:4317").connect_lazy();
        CollectorConnection::new("127.0.0.1:4317", channel)
    }

    async fn wait_for_leases(conn: &CollectorConnection, expected: usize) {
        for _ in 0..100 {
            if conn.active_leases() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("leases stuck at {}", conn.active_leases());
    }

    /// Accepts every export and never answers.
    #[derive(Debug)]
    struct StuckExporter;

    impl AggregationSelector for StuckExporter {
        fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
            DefaultAggregationSelector::new().aggregation(kind)
        }
    }

    impl TemporalitySelector for StuckExporter {
        fn temporality(&self, kind: InstrumentKind) -> Temporality {
            DefaultTemporalitySelector::new().temporality(kind)
        }
    }

    #[async_trait]
    impl PushMetricsExporter for StuckExporter {
        async fn export(&self, _metrics: &mut ResourceMetrics) -> MetricsResult<()> {
            std::future::pending::<MetricsResult<()>>().await
        }

        async fn force_flush(&self) -> MetricsResult<()> {
            Ok(())
        }

        fn shutdown(&self) -> MetricsResult<()> {
            Ok(())
        }
    }

    fn config(period: Duration) -> MetricsPipelineConfig {
        MetricsPipelineConfig::new(ResourceDescriptor::new("svc-a")).with_collect_period(period)
    }

    #[test]
    fn defaults_are_correct() {
        let cfg = MetricsPipelineConfig::new(ResourceDescriptor::new("svc"));
        assert_eq!(cfg.collect_period, Duration::from_secs(30));
        assert_eq!(cfg.export_timeout, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_export_timeout() {
        let cfg = config(Duration::from_secs(30)).with_export_timeout(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn sub_second_period_is_rejected_and_nothing_is_installed() {
        let registry = TelemetryRegistry::new();
        let before = registry.meter_provider();
        let conn = lazy_connection();

        for period in [Duration::ZERO, Duration::from_millis(999)] {
            let err = build_metrics_pipeline(&conn, &config(period), &registry).unwrap_err();
            assert!(err.is_configuration());
        }

        assert!(Arc::ptr_eq(&before, &registry.meter_provider()));
        assert_eq!(conn.active_leases(), 0);
    }

    // The periodic reader blocks on its worker task during shutdown, so every
    // test that builds a real provider runs on a multi-threaded runtime.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_second_period_is_accepted() {
        let registry = TelemetryRegistry::new();
        let conn = lazy_connection();
        let pipeline =
            build_metrics_pipeline(&conn, &config(Duration::from_secs(1)), &registry).unwrap();

        assert!(Arc::ptr_eq(&pipeline.provider(), &registry.meter_provider()));
        assert_eq!(conn.active_leases(), 1);

        // Nothing listens on the collector port; the final export fails or
        // times out, but the lease is returned either way.
        let _ = pipeline.shutdown(Duration::from_secs(2)).await;
        wait_for_leases(&conn, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_export_times_out_shutdown_but_holds_lease_until_reader_stops() {
        let registry = TelemetryRegistry::new();
        let conn = lazy_connection();
        let cfg = config(Duration::from_secs(60)).with_export_timeout(Duration::from_secs(2));
        let pipeline = install(StuckExporter, &cfg, &registry, Some(conn.lease()));
        registry.meter("test").u64_counter("requests").init().add(1, &[]);

        let err = pipeline
            .shutdown(Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, TelemetryError::ShutdownTimeout(t) if t == Duration::from_millis(100)));
        assert_eq!(conn.active_leases(), 1);

        // The reader's own export timeout ends the final cycle, then the
        // lease comes back.
        wait_for_leases(&conn, 0).await;
        assert!(conn.close().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exported_resource_carries_service_name_and_export_stops_after_shutdown() {
        let exporter = InMemoryMetricsExporter::default();
        let registry = TelemetryRegistry::new();
        let pipeline = install(
            exporter.clone(),
            &config(Duration::from_secs(30)),
            &registry,
            None,
        );

        let counter = registry.meter("test").u64_counter("requests").init();
        counter.add(3, &[]);
        pipeline.force_flush(Duration::from_secs(1)).await.unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        assert!(!exported.is_empty());
        for batch in &exported {
            assert_eq!(
                batch.resource.get(Key::from_static_str(SERVICE_NAME)),
                Some(Value::from("svc-a"))
            );
        }

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        let after_shutdown = exporter.get_finished_metrics().unwrap().len();

        counter.add(5, &[]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exporter.get_finished_metrics().unwrap().len(), after_shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_idempotent_and_resets_registry() {
        let registry = TelemetryRegistry::new();
        let pipeline = install(
            InMemoryMetricsExporter::default(),
            &config(Duration::from_secs(30)),
            &registry,
            None,
        );
        let installed = pipeline.provider();

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        assert!(!Arc::ptr_eq(&installed, &registry.meter_provider()));
        assert!(pipeline.force_flush(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_lease() {
        let registry = TelemetryRegistry::new();
        let conn = lazy_connection();
        let pipeline = install(
            InMemoryMetricsExporter::default(),
            &config(Duration::from_secs(30)),
            &registry,
            Some(conn.lease()),
        );
        assert_eq!(conn.active_leases(), 1);

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.active_leases(), 0);
        assert!(conn.close().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn later_install_wins() {
        let registry = TelemetryRegistry::new();
        let first = install(
            InMemoryMetricsExporter::default(),
            &config(Duration::from_secs(30)),
            &registry,
            None,
        );
        let second = install(
            InMemoryMetricsExporter::default(),
            &config(Duration::from_secs(30)),
            &registry,
            None,
        );
        assert!(Arc::ptr_eq(&second.provider(), &registry.meter_provider()));

        // Shutting down the replaced pipeline leaves the newer one in place.
        first.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(Arc::ptr_eq(&second.provider(), &registry.meter_provider()));
        second.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
