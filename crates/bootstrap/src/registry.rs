//! [`TelemetryRegistry`]: the provider slots instrumentation code draws from.
//!
//! Pipelines install their providers here instead of in process-global state.
//! Components hold a clone of the registry and look providers up when they
//! create instruments, so a later install is always visible to them. Reads
//! are lock-free (`arc-swap`), which keeps the hot instrumentation path free
//! of locks.

use std::borrow::Cow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, Tracer, TracerProvider};

/// Shared slots for the active meter and tracer providers.
///
/// Starts out with inert providers: instruments and spans created before a
/// pipeline is installed are valid but record nothing.
#[derive(Clone, Debug)]
pub struct TelemetryRegistry {
    inner: Arc<Slots>,
}

#[derive(Debug)]
struct Slots {
    meter: ArcSwap<SdkMeterProvider>,
    tracer: ArcSwap<TracerProvider>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Slots {
                meter: ArcSwap::from_pointee(noop_meter_provider()),
                tracer: ArcSwap::from_pointee(noop_tracer_provider()),
            }),
        }
    }

    /// Currently installed meter provider.
    pub fn meter_provider(&self) -> Arc<SdkMeterProvider> {
        self.inner.meter.load_full()
    }

    /// Currently installed tracer provider.
    pub fn tracer_provider(&self) -> Arc<TracerProvider> {
        self.inner.tracer.load_full()
    }

    /// Create a meter from the currently installed provider.
    pub fn meter(&self, name: impl Into<Cow<'static, str>>) -> Meter {
        self.inner.meter.load().meter(name)
    }

    /// Create a tracer from the currently installed provider.
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> Tracer {
        self.inner.tracer.load().tracer(name)
    }

    /// Replace the meter provider. The last install wins.
    pub fn install_meter_provider(&self, provider: SdkMeterProvider) -> Arc<SdkMeterProvider> {
        let provider = Arc::new(provider);
        self.inner.meter.store(Arc::clone(&provider));
        provider
    }

    /// Replace the tracer provider. The last install wins.
    pub fn install_tracer_provider(&self, provider: TracerProvider) -> Arc<TracerProvider> {
        let provider = Arc::new(provider);
        self.inner.tracer.store(Arc::clone(&provider));
        provider
    }

    /// Reset the meter slot to an inert provider if it still holds `owned`.
    ///
    /// Returns `false` when another pipeline has replaced it in the meantime.
    pub fn release_meter_provider(&self, owned: &Arc<SdkMeterProvider>) -> bool {
        let prev = self
            .inner
            .meter
            .compare_and_swap(owned, Arc::new(noop_meter_provider()));
        Arc::ptr_eq(&*prev, owned)
    }

    /// Reset the tracer slot to an inert provider if it still holds `owned`.
    pub fn release_tracer_provider(&self, owned: &Arc<TracerProvider>) -> bool {
        let prev = self
            .inner
            .tracer
            .compare_and_swap(owned, Arc::new(noop_tracer_provider()));
        Arc::ptr_eq(&*prev, owned)
    }
}

impl Default for TelemetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Meter provider with no readers: instruments accept measurements and drop them.
pub(crate) fn noop_meter_provider() -> SdkMeterProvider {
    SdkMeterProvider::builder().build()
}

/// Tracer provider that samples nothing and has no processors.
pub(crate) fn noop_tracer_provider() -> TracerProvider {
    TracerProvider::builder()
        .with_config(sdktrace::Config::default().with_sampler(Sampler::AlwaysOff))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, Tracer as _};

    #[test]
    fn fresh_registry_hands_out_inert_instruments() {
        let registry = TelemetryRegistry::new();
        let counter = registry.meter("test").u64_counter("requests").init();
        counter.add(1, &[]);

        let mut span = registry.tracer("test").start("op");
        assert!(!span.is_recording());
        span.end();
    }

    #[test]
    fn install_replaces_provider() {
        let registry = TelemetryRegistry::new();
        let before = registry.meter_provider();
        let installed = registry.install_meter_provider(noop_meter_provider());
        assert!(!Arc::ptr_eq(&before, &registry.meter_provider()));
        assert!(Arc::ptr_eq(&installed, &registry.meter_provider()));
    }

    #[test]
    fn clones_share_slots() {
        let registry = TelemetryRegistry::new();
        let clone = registry.clone();
        let installed = registry.install_tracer_provider(noop_tracer_provider());
        assert!(Arc::ptr_eq(&installed, &clone.tracer_provider()));
    }

    #[test]
    fn release_only_resets_own_provider() {
        let registry = TelemetryRegistry::new();
        let first = registry.install_meter_provider(noop_meter_provider());
        let second = registry.install_meter_provider(noop_meter_provider());

        assert!(!registry.release_meter_provider(&first));
        assert!(Arc::ptr_eq(&second, &registry.meter_provider()));

        assert!(registry.release_meter_provider(&second));
        assert!(!Arc::ptr_eq(&second, &registry.meter_provider()));
    }

    #[test]
    fn release_tracer_resets_slot() {
        let registry = TelemetryRegistry::new();
        let installed = registry.install_tracer_provider(noop_tracer_provider());
        assert!(registry.release_tracer_provider(&installed));
        assert!(!Arc::ptr_eq(&installed, &registry.tracer_provider()));
    }
}
