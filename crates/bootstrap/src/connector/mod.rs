//! Resilient connection to the telemetry collector.
//!
//! # Lifecycle
//!
//! The initial handshake is driven as an explicit state machine:
//!
//! ```text
//! Idle ──► Attempting ──ok──► Succeeded
//!              │ err
//!              ▼
//!           Backoff ──sleep──► Attempting
//!              │
//!              ├── bound exceeded ──► Exhausted
//!              └── token canceled ──► Canceled
//! ```
//!
//! Only the initial handshake is governed here. After [`Connector::connect`]
//! returns, the channel reconnects on its own after transient drops.
//!
//! # Invariants
//!
//! - Configuration errors (bad TLS selection, invalid policy, malformed
//!   endpoint) are returned before or instead of any retry.
//! - Cancellation is observed both mid-attempt and mid-sleep.
//! - No global state is touched.

pub mod backoff;
pub mod tls;
pub mod transport;

pub use backoff::{BackoffPolicy, RetryLimit};
pub use tls::{ClientIdentity, TlsSettings, TransportSecurity};
pub use transport::{TonicTransport, Transport};

use std::time::Duration;

use common::{DialError, TelemetryError};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::connection::CollectorConnection;

/// States of the initial-handshake retry loop.
///
/// `C` is the transport's connection type, handed over in `Succeeded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectState<C> {
    Idle,
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32, connection: C },
    Exhausted { attempts: u32 },
    Canceled { attempts: u32 },
}

/// Opens the collector connection through a [`Transport`] under a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Connector<T> {
    transport: T,
    policy: BackoffPolicy,
}

impl<T: Transport> Connector<T> {
    pub fn new(transport: T, policy: BackoffPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Establish the connection, retrying with backoff until success, the
    /// policy bound, or cancellation of `cancel`.
    ///
    /// With [`RetryLimit::MaxElapsed`] the bound covers the dials too: an
    /// attempt never runs past the remaining budget.
    ///
    /// # Errors
    ///
    /// - [`TelemetryError::Configuration`] if `tls` holds more than one entry,
    ///   the policy is invalid, or the endpoint can never be dialed.
    /// - [`TelemetryError::Connection`] once the attempt or elapsed-time bound
    ///   is exceeded; wraps the last dial error.
    /// - [`TelemetryError::Canceled`] if `cancel` fires first.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        tls: &[TlsSettings],
    ) -> Result<CollectorConnection<T::Connection>, TelemetryError> {
        let security = TransportSecurity::from_configs(tls)?;
        self.policy.validate()?;
        if endpoint.trim().is_empty() {
            return Err(TelemetryError::config("collector endpoint must not be empty"));
        }

        let started = Instant::now();
        let mut state = ConnectState::Idle;
        let mut last_error: Option<DialError> = None;

        loop {
            state = match state {
                ConnectState::Idle => ConnectState::Attempting { attempt: 1 },

                ConnectState::Attempting { attempt } => {
                    match self.attempt_timeout(started.elapsed()) {
                        None => ConnectState::Exhausted {
                            attempts: attempt.saturating_sub(1),
                        },
                        Some(timeout) => {
                            debug!(endpoint, attempt, ?timeout, "dialing collector");
                            let dial = tokio::time::timeout(
                                timeout,
                                self.transport.dial(endpoint, &security, timeout),
                            );
                            let outcome = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => None,
                                res = dial => Some(res.unwrap_or(Err(DialError::TimedOut(timeout)))),
                            };
                            match outcome {
                                None => ConnectState::Canceled { attempts: attempt },
                                Some(Ok(connection)) => ConnectState::Succeeded {
                                    attempts: attempt,
                                    connection,
                                },
                                Some(Err(e)) if !e.is_retryable() => {
                                    return Err(TelemetryError::config(e.to_string()));
                                }
                                Some(Err(e)) => {
                                    let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                                    let next = self.after_failure(attempt, started.elapsed(), unit);
                                    if let ConnectState::Backoff { delay, .. } = next {
                                        warn!(endpoint, attempt, error = %e, ?delay, "collector dial failed; backing off");
                                    }
                                    last_error = Some(e);
                                    next
                                }
                            }
                        }
                    }
                }

                ConnectState::Backoff { attempt, delay } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => ConnectState::Canceled { attempts: attempt },
                        _ = tokio::time::sleep(delay) => ConnectState::Attempting { attempt: attempt + 1 },
                    }
                }

                ConnectState::Succeeded {
                    attempts,
                    connection,
                } => {
                    info!(endpoint, attempts, elapsed = ?started.elapsed(), "connected to collector");
                    return Ok(CollectorConnection::new(endpoint, connection));
                }

                ConnectState::Exhausted { attempts } => {
                    let elapsed = started.elapsed();
                    let source = last_error.take().unwrap_or_else(|| {
                        DialError::Unavailable("no connection attempt completed".into())
                    });
                    warn!(endpoint, attempts, ?elapsed, error = %source, "giving up on collector");
                    return Err(TelemetryError::Connection {
                        endpoint: endpoint.to_owned(),
                        attempts,
                        elapsed,
                        source,
                    });
                }

                ConnectState::Canceled { attempts } => {
                    let elapsed = started.elapsed();
                    info!(endpoint, attempts, ?elapsed, "collector connect canceled");
                    return Err(TelemetryError::Canceled { attempts, elapsed });
                }
            };
        }
    }

    /// Timeout for a dial started `elapsed` into the connect call.
    ///
    /// `None` once an elapsed-time bound has no budget left.
    pub fn attempt_timeout(&self, elapsed: Duration) -> Option<Duration> {
        let cap = self.policy.min_connect_timeout;
        match self.policy.limit {
            RetryLimit::MaxElapsed(max) => {
                let left = max.saturating_sub(elapsed);
                (!left.is_zero()).then(|| cap.min(left))
            }
            RetryLimit::MaxAttempts(_) => Some(cap),
        }
    }

    /// Transition taken after failed attempt number `attempt` (one-based).
    ///
    /// `jitter_unit` is a sample from `[-1, 1]`.
    pub fn after_failure(
        &self,
        attempt: u32,
        elapsed: Duration,
        jitter_unit: f64,
    ) -> ConnectState<T::Connection> {
        let delay = self
            .policy
            .jittered(self.policy.delay(attempt.saturating_sub(1)), jitter_unit);
        match self.policy.limit {
            RetryLimit::MaxAttempts(max) if attempt >= max => {
                ConnectState::Exhausted { attempts: attempt }
            }
            RetryLimit::MaxElapsed(max) if elapsed.saturating_add(delay) >= max => {
                ConnectState::Exhausted { attempts: attempt }
            }
            _ => ConnectState::Backoff { attempt, delay },
        }
    }
}

/// Connect to `endpoint` over gRPC with the given TLS selection and backoff policy.
///
/// See [`Connector::connect`] for the error contract.
pub async fn connect(
    cancel: &CancellationToken,
    endpoint: &str,
    tls: &[TlsSettings],
    policy: BackoffPolicy,
) -> Result<CollectorConnection<Channel>, TelemetryError> {
    Connector::new(TonicTransport, policy)
        .connect(cancel, endpoint, tls)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
