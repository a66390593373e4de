//! Telemetry bootstrap: one resilient collector connection, shared by an
//! OTLP metrics pipeline and an OTLP trace pipeline.
//!
//! Typical startup:
//!
//! 1. [`connect`] to the collector (backoff, jitter, cancellation).
//! 2. [`build_metrics_pipeline`] and [`build_trace_pipeline`] (or
//!    [`build_noop_trace_pipeline`]) on that connection, installing their
//!    providers in a [`TelemetryRegistry`].
//! 3. Instrument through the registry.
//! 4. [`shutdown_all`] on the way out: pipelines first, connection last.

pub mod connection;
pub mod connector;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod timer;
pub mod traces;

pub use connection::{CollectorConnection, ConnectionLease};
pub use connector::{connect, BackoffPolicy, ConnectState, Connector, RetryLimit, TlsSettings};
pub use metrics::{build_metrics_pipeline, MetricsPipeline, MetricsPipelineConfig};
pub use pipeline::{shutdown_all, PipelineShutdown};
pub use registry::TelemetryRegistry;
pub use timer::Timer;
pub use traces::{
    build_noop_trace_pipeline, build_trace_pipeline, BatchConfig, CollectorAuth, TracePipeline,
    TracePipelineConfig,
};
