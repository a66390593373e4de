//! Batched OTLP trace pipeline and its no-op counterpart.
//!
//! Spans are sampled by trace ID at `sampling_ratio`, so every span of a
//! trace gets the same decision. Sampled spans go through the SDK batch
//! processor (see [`batch`]) to an OTLP/gRPC exporter that shares the
//! collector connection. When collector auth is configured, the Honeycomb
//! header pair is attached to every export.
//!
//! The SDK reports spans dropped on a full queue through its global error
//! handler.

pub mod batch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use common::{ResourceDescriptor, TelemetryError};
use opentelemetry_otlp::{SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, SpanProcessor, TracerProvider};
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tracing::{debug, info, warn};

use crate::connection::{CollectorConnection, ConnectionLease};
use crate::pipeline::{ensure_runtime, PipelineShutdown};
use crate::registry::{noop_tracer_provider, TelemetryRegistry};
use crate::resource;

pub use batch::{BatchConfig, SharedProcessor};

/// gRPC metadata key carrying the collector API key.
pub const API_KEY_HEADER: &str = "x-honeycomb-team";
/// gRPC metadata key carrying the target dataset.
pub const DATASET_HEADER: &str = "x-honeycomb-dataset";

/// Credentials sent to a hosted collector with every span export.
#[derive(Clone, PartialEq)]
pub struct CollectorAuth {
    pub api_key: String,
    pub dataset: String,
}

impl std::fmt::Debug for CollectorAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorAuth")
            .field("api_key", &"<redacted>")
            .field("dataset", &self.dataset)
            .finish()
    }
}

impl CollectorAuth {
    pub fn new(api_key: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            dataset: dataset.into(),
        }
    }

    /// Header pair as gRPC metadata.
    ///
    /// # Errors
    ///
    /// [`TelemetryError::Configuration`] if either value is empty or not a
    /// valid ASCII header value.
    pub fn metadata(&self) -> Result<MetadataMap, TelemetryError> {
        let mut map = MetadataMap::new();
        for (key, value) in [(API_KEY_HEADER, &self.api_key), (DATASET_HEADER, &self.dataset)] {
            if value.trim().is_empty() {
                return Err(TelemetryError::config(format!("{key} must not be empty")));
            }
            let value: AsciiMetadataValue = value
                .parse()
                .map_err(|_| TelemetryError::config(format!("{key} is not a valid header value")))?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Settings for [`build_trace_pipeline`].
#[derive(Debug, Clone)]
pub struct TracePipelineConfig {
    pub sampling_ratio: f64,
    pub resource: ResourceDescriptor,
    pub auth: Option<CollectorAuth>,
    pub batch: BatchConfig,
}

impl TracePipelineConfig {
    /// Samples every trace, no auth, default batching.
    pub fn new(resource: ResourceDescriptor) -> Self {
        Self {
            sampling_ratio: 1.0,
            resource,
            auth: None,
            batch: BatchConfig::default(),
        }
    }

    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio;
        self
    }

    pub fn with_auth(mut self, auth: CollectorAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        // NaN fails the range check.
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(TelemetryError::config(format!(
                "sampling ratio must be within [0, 1], got {}",
                self.sampling_ratio
            )));
        }
        if let Some(auth) = &self.auth {
            auth.metadata()?;
        }
        self.batch.validate()?;
        self.resource.validate()
    }

    fn exporter_label(&self) -> &'static str {
        if self.auth.is_some() {
            "honeycomb"
        } else {
            "collector"
        }
    }
}

/// Running trace pipeline, or the inert one from [`build_noop_trace_pipeline`].
#[derive(Debug)]
pub struct TracePipeline {
    provider: Arc<TracerProvider>,
    registry: TelemetryRegistry,
    processor: Option<SharedProcessor>,
    lease: ArcSwapOption<ConnectionLease>,
    shut_down: AtomicBool,
}

/// Build the batched OTLP trace pipeline on `connection` and install it in `registry`.
///
/// # Errors
///
/// - [`TelemetryError::Configuration`] for an out-of-range sampling ratio,
///   invalid auth headers or batch limits, or a missing Tokio runtime.
/// - [`TelemetryError::ExporterConstruction`] if the OTLP exporter cannot be
///   built. Nothing is installed in that case.
pub fn build_trace_pipeline(
    connection: &CollectorConnection,
    config: &TracePipelineConfig,
    registry: &TelemetryRegistry,
) -> Result<TracePipeline, TelemetryError> {
    config.validate()?;
    ensure_runtime()?;

    let lease = connection.lease();
    let mut exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_channel(lease.channel().clone())
        .with_timeout(config.batch.export_timeout);
    if let Some(auth) = &config.auth {
        exporter = exporter.with_metadata(auth.metadata()?);
    }
    let exporter = SpanExporterBuilder::from(exporter)
        .build_span_exporter()
        .map_err(|e| TelemetryError::ExporterConstruction(format!("OTLP span exporter: {e}")))?;

    info!(
        endpoint = connection.endpoint(),
        sampling_ratio = config.sampling_ratio,
        exporter = config.exporter_label(),
        service = %config.resource.service_name,
        "trace pipeline installed"
    );
    Ok(install(exporter, config, registry, Some(lease)))
}

/// Install a provider that records nothing and never touches the network.
///
/// Used when tracing is disabled; callers keep the same [`TracePipeline`] shape.
pub fn build_noop_trace_pipeline(registry: &TelemetryRegistry) -> TracePipeline {
    debug!("installing no-op trace pipeline");
    TracePipeline {
        provider: registry.install_tracer_provider(noop_tracer_provider()),
        registry: registry.clone(),
        processor: None,
        lease: ArcSwapOption::empty(),
        shut_down: AtomicBool::new(false),
    }
}

pub(crate) fn install<E: SpanExporter + 'static>(
    exporter: E,
    config: &TracePipelineConfig,
    registry: &TelemetryRegistry,
    lease: Option<ConnectionLease>,
) -> TracePipeline {
    let processor = batch::processor(exporter, &config.batch);

    let provider = TracerProvider::builder()
        .with_span_processor(processor.clone())
        .with_config(
            sdktrace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
                .with_resource(resource::merged(&config.resource, config.exporter_label())),
        )
        .build();

    TracePipeline {
        provider: registry.install_tracer_provider(provider),
        registry: registry.clone(),
        processor: Some(processor),
        lease: ArcSwapOption::from_pointee(lease),
        shut_down: AtomicBool::new(false),
    }
}

impl TracePipeline {
    /// The provider this pipeline installed.
    pub fn provider(&self) -> Arc<TracerProvider> {
        Arc::clone(&self.provider)
    }

    /// Export buffered spans now and wait for the export.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), TelemetryError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TelemetryError::Shutdown("trace pipeline is shut down".into()));
        }
        if self.processor.is_none() {
            return Ok(());
        }
        let provider = Arc::clone(&self.provider);
        // The SDK blocks the calling thread until the batch worker answers.
        let flush = tokio::task::spawn_blocking(move || provider.force_flush());
        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(results)) => results
                .into_iter()
                .collect::<Result<(), _>>()
                .map_err(|e| TelemetryError::ExportCycle(e.to_string())),
            Ok(Err(join)) => Err(TelemetryError::ExportCycle(join.to_string())),
            Err(_) => Err(TelemetryError::ShutdownTimeout(timeout)),
        }
    }
}

#[async_trait]
impl PipelineShutdown for TracePipeline {
    fn name(&self) -> &'static str {
        "traces"
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("trace pipeline already shut down");
            return Ok(());
        }

        self.registry.release_tracer_provider(&self.provider);
        let Some(mut processor) = self.processor.clone() else {
            return Ok(());
        };

        // Runs to completion even if the timeout below fires, so the batch
        // worker always stops. The lease is held until then: the final export
        // still goes over the channel.
        let lease = self.lease.swap(None);
        let stop = tokio::task::spawn_blocking(move || {
            let result = processor.shutdown();
            drop(lease);
            result
        });
        match tokio::time::timeout(timeout, stop).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TelemetryError::Shutdown(format!("traces: {e}"))),
            Ok(Err(join)) => Err(TelemetryError::Shutdown(format!("traces: {join}"))),
            Err(_) => {
                warn!(?timeout, "trace shutdown timed out; batch worker stops in the background");
                Err(TelemetryError::ShutdownTimeout(timeout))
            }
        }
    }
}

// ---- Tests ----
