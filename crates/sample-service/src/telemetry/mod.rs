//! Log subscriber for the sample service.
//!
//! Structured JSON logs go to stdout from the first line of `main`. The
//! OpenTelemetry bridge is not available until the trace pipeline exists, so
//! the subscriber carries an empty reload slot that [`LogHandle::attach_tracer`]
//! fills in later.

use anyhow::Result;
use opentelemetry_sdk::trace::Tracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

type BridgeSlot = Option<Box<dyn Layer<Registry> + Send + Sync>>;

/// Handle to the reloadable OpenTelemetry bridge layer.
#[derive(Clone)]
pub struct LogHandle {
    bridge: reload::Handle<BridgeSlot, Registry>,
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level` when set.
///
/// # Errors
///
/// Returns an error if the subscriber has already been set.
pub fn init(log_level: &str) -> Result<LogHandle> {
    let (bridge, handle) = reload::Layer::new(BridgeSlot::None);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(bridge)
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))?;

    Ok(LogHandle { bridge: handle })
}

impl LogHandle {
    /// Export `tracing` spans through `tracer` from now on.
    pub fn attach_tracer(&self, tracer: Tracer) -> Result<()> {
        let layer = tracing_opentelemetry::layer::<Registry>().with_tracer(tracer);
        self.bridge
            .modify(|slot| *slot = Some(Box::new(layer)))
            .map_err(|e| anyhow::anyhow!("failed to attach OpenTelemetry layer: {e}"))
    }

    /// Stop bridging spans; called before the trace pipeline shuts down.
    pub fn detach_tracer(&self) -> Result<()> {
        self.bridge
            .modify(|slot| *slot = None)
            .map_err(|e| anyhow::anyhow!("failed to detach OpenTelemetry layer: {e}"))
    }
}
