//! [`CollectorConnection`]: the shared collector channel and its leases.
//!
//! Each pipeline takes a [`ConnectionLease`] when it is built and releases it
//! when its shutdown completes. The owner closes the connection last; closing
//! while leases are outstanding is reported instead of silently pulling the
//! transport out from under a running exporter.

use std::sync::Arc;

use common::TelemetryError;
use tonic::transport::Channel;
use tracing::{info, warn};

/// Long-lived handle to the collector, owned by the caller of
/// [`connect`](crate::connector::connect).
#[derive(Debug)]
pub struct CollectorConnection<C = Channel> {
    endpoint: String,
    inner: C,
    leases: Arc<()>,
}

impl<C> CollectorConnection<C> {
    pub fn new(endpoint: impl Into<String>, inner: C) -> Self {
        Self {
            endpoint: endpoint.into(),
            inner,
            leases: Arc::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of leases not yet released.
    pub fn active_leases(&self) -> usize {
        Arc::strong_count(&self.leases) - 1
    }

    /// Release the owner's handle on the transport.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConnectionInUse`] if pipelines have not been
    /// shut down yet. The transport then stays open until the last lease is
    /// dropped.
    pub fn close(self) -> Result<(), TelemetryError> {
        let active = self.active_leases();
        if active > 0 {
            warn!(endpoint = %self.endpoint, active, "closing collector connection with live leases");
            return Err(TelemetryError::ConnectionInUse(active));
        }
        info!(endpoint = %self.endpoint, "collector connection closed");
        Ok(())
    }
}

impl<C: Clone> CollectorConnection<C> {
    /// Read-only handle for a pipeline; keeps the connection marked as in use.
    pub fn lease(&self) -> ConnectionLease<C> {
        ConnectionLease {
            inner: self.inner.clone(),
            _guard: Arc::clone(&self.leases),
        }
    }
}

/// A pipeline's share of the collector connection.
#[derive(Debug)]
pub struct ConnectionLease<C = Channel> {
    inner: C,
    _guard: Arc<()>,
}

impl<C> ConnectionLease<C> {
    pub fn channel(&self) -> &C {
        &self.inner
    }
}
