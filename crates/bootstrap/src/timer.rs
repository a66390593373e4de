//! Elapsed-time helper for latency histograms.

use tokio::time::Instant;

/// Wall-clock stopwatch reporting whole milliseconds.
///
/// Built on [`tokio::time::Instant`], so it follows paused test time.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds since [`Timer::start`], saturating at `u64::MAX`.
    pub fn observe_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
