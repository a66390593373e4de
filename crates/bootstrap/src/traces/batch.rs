//! Span batching on the SDK's [`BatchSpanProcessor`].
//!
//! [`BatchConfig`] carries the limits the pipeline accepts and validates; it
//! is mapped onto the SDK's own config when the processor is built. The
//! processor exports when a batch fills up or `max_delay` passes, whichever
//! comes first, and cuts each export off at `export_timeout`.
//!
//! The tracer provider owns its processors and only shuts them down when its
//! last handle is dropped. [`SharedProcessor`] keeps a second handle on the
//! batch processor so the pipeline can stop it on its own schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use common::TelemetryError;
use opentelemetry::trace::TraceResult;
use opentelemetry::Context;
use opentelemetry_sdk::export::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, Span, SpanProcessor};
use tracing::debug;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 512;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2048;
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Batching limits for span export.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_delay: Duration,
    pub max_queue_size: usize,
    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_delay: DEFAULT_MAX_DELAY,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
        }
    }
}

impl BatchConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.max_batch_size == 0 {
            return Err(TelemetryError::config("max_batch_size must be > 0"));
        }
        if self.max_queue_size < self.max_batch_size {
            return Err(TelemetryError::config(format!(
                "max_queue_size ({}) must be >= max_batch_size ({})",
                self.max_queue_size, self.max_batch_size
            )));
        }
        if self.max_delay.is_zero() {
            return Err(TelemetryError::config("batch max_delay must be > 0"));
        }
        if self.export_timeout.is_zero() {
            return Err(TelemetryError::config("span export_timeout must be > 0"));
        }
        Ok(())
    }

    /// The SDK's view of these limits. Takes precedence over `OTEL_BSP_*`.
    fn sdk_config(&self) -> opentelemetry_sdk::trace::BatchConfig {
        BatchConfigBuilder::default()
            .with_max_queue_size(self.max_queue_size)
            .with_max_export_batch_size(self.max_batch_size)
            .with_scheduled_delay(self.max_delay)
            .with_max_export_timeout(self.export_timeout)
            .with_max_concurrent_exports(1)
            .build()
    }
}

#[derive(Debug)]
struct Inner {
    processor: RwLock<BatchSpanProcessor<runtime::Tokio>>,
    stopped: AtomicBool,
}

/// Handle on a Tokio batch processor, shared by the provider and the pipeline.
///
/// The first `shutdown` stops the SDK worker. Later calls, including the one
/// the provider makes when it is dropped, return `Ok` without blocking.
#[derive(Debug, Clone)]
pub struct SharedProcessor {
    inner: Arc<Inner>,
}

/// Start a batch processor for `exporter` on the current Tokio runtime.
pub(crate) fn processor<E>(exporter: E, config: &BatchConfig) -> SharedProcessor
where
    E: SpanExporter + 'static,
{
    let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio)
        .with_batch_config(config.sdk_config())
        .build();
    SharedProcessor {
        inner: Arc::new(Inner {
            processor: RwLock::new(processor),
            stopped: AtomicBool::new(false),
        }),
    }
}

impl SharedProcessor {
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, BatchSpanProcessor<runtime::Tokio>> {
        match self.inner.processor.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SpanProcessor for SharedProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        if !self.is_stopped() {
            self.read().on_start(span, cx);
        }
    }

    fn on_end(&self, span: SpanData) {
        if !self.is_stopped() {
            self.read().on_end(span);
        }
    }

    /// Blocks until the worker has exported what it holds.
    fn force_flush(&self) -> TraceResult<()> {
        if self.is_stopped() {
            return Ok(());
        }
        self.read().force_flush()
    }

    /// Blocks until the worker has exported what it holds and stopped.
    fn shutdown(&mut self) -> TraceResult<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut processor = match self.inner.processor.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = processor.shutdown();
        debug!(ok = result.is_ok(), "span batch worker stopped");
        result
    }
}

// ---- Tests ----
