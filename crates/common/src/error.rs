//! Error types shared across the bootstrap crates.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single dial attempt against the collector.
///
/// Produced by transports; the connector decides whether to retry based on
/// [`DialError::is_retryable`].
#[derive(Debug, Clone, Error)]
pub enum DialError {
    /// The endpoint or TLS material can never produce a connection.
    #[error("invalid dial target: {0}")]
    Invalid(String),

    /// The collector refused or dropped the handshake.
    #[error("collector unavailable: {0}")]
    Unavailable(String),

    /// The attempt did not complete within the per-attempt connect timeout.
    #[error("connect attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl DialError {
    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DialError::Invalid(_))
    }
}

/// Top-level error type for connection and pipeline bootstrap.
///
/// Variants follow the failure taxonomy of the bootstrap sequence:
/// - [`TelemetryError::Configuration`] → invalid input, detected before any I/O
/// - [`TelemetryError::Connection`] → initial handshake exhausted its retry budget
/// - [`TelemetryError::ExporterConstruction`] → exporter could not be built on a live connection
/// - [`TelemetryError::Canceled`] → caller canceled while waiting
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid caller input; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The collector could not be reached within the backoff policy bound.
    #[error("connecting to {endpoint} failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Connection {
        endpoint: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: DialError,
    },

    /// The exporter could not be constructed against an established connection.
    #[error("exporter construction failed: {0}")]
    ExporterConstruction(String),

    /// A single export cycle failed or timed out. Reported through logs only.
    #[error("export cycle failed: {0}")]
    ExportCycle(String),

    /// The caller canceled the operation.
    #[error("canceled after {attempts} attempt(s) in {elapsed:?}")]
    Canceled { attempts: u32, elapsed: Duration },

    /// A pipeline did not finish flushing within the shutdown timeout.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// A pipeline shutdown step reported a failure.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// The connection is still leased by running pipelines.
    #[error("connection still leased by {0} pipeline(s)")]
    ConnectionInUse(usize),
}

impl TelemetryError {
    /// Shorthand for a [`TelemetryError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        TelemetryError::Configuration(msg.into())
    }

    /// Returns `true` for errors raised by input validation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, TelemetryError::Configuration(_))
    }

    /// Returns `true` if the caller's cancellation ended the operation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TelemetryError::Canceled { .. })
    }
}
