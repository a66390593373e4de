//! Periodic heartbeat: the service's only workload, exercising both pipelines.

use std::time::Duration;

use bootstrap::{TelemetryRegistry, Timer};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Emit one heartbeat per `interval` until `cancel` fires. Returns the beat count.
///
/// Instruments are created once from the registry, so they belong to the
/// meter provider installed at the time the loop starts.
pub async fn run(registry: TelemetryRegistry, cancel: CancellationToken, interval: Duration) -> u64 {
    let meter = registry.meter("sample-service");
    let beats = meter
        .u64_counter("heartbeats")
        .with_description("Heartbeats emitted since start")
        .init();
    let latency = meter
        .u64_histogram("heartbeat.duration_ms")
        .with_description("Time spent in one heartbeat")
        .init();

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately

    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let timer = Timer::start();
                count += 1;
                beat(count).instrument(info_span!("heartbeat", count)).await;

                let attrs = [KeyValue::new("outcome", "ok")];
                beats.add(1, &attrs);
                latency.record(timer.observe_ms(), &attrs);
            }
        }
    }
    debug!(count, "heartbeat loop stopped");
    count
}

async fn beat(count: u64) {
    tokio::task::yield_now().await;
    debug!(count, "heartbeat");
}
