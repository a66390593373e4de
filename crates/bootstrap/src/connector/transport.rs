//! Dial seam between the retry loop and the gRPC stack.

use std::time::Duration;

use async_trait::async_trait;
use common::DialError;
use tonic::transport::{Channel, Endpoint};

use super::tls::TransportSecurity;

/// A single attempt at opening the collector connection.
///
/// The connector owns retries, backoff and cancellation; implementations
/// perform exactly one handshake per call.
#[cfg_attr(test, mockall::automock(type Connection = ();))]
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Send;

    async fn dial(
        &self,
        endpoint: &str,
        security: &TransportSecurity,
        connect_timeout: Duration,
    ) -> Result<Self::Connection, DialError>;
}

/// Eagerly connected tonic channel (HTTP/2).
///
/// Once established, the channel re-establishes dropped transports on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct TonicTransport;

#[async_trait]
impl Transport for TonicTransport {
    type Connection = Channel;

    async fn dial(
        &self,
        endpoint: &str,
        security: &TransportSecurity,
        connect_timeout: Duration,
    ) -> Result<Channel, DialError> {
        let uri = endpoint_uri(endpoint, security);
        let mut ep = Endpoint::from_shared(uri.clone())
            .map_err(|e| DialError::Invalid(format!("{uri}: {e}")))?
            .connect_timeout(connect_timeout);

        if let TransportSecurity::Tls(tls) = security {
            ep = ep
                .tls_config(tls.client_config())
                .map_err(|e| DialError::Invalid(format!("TLS configuration for {uri}: {e}")))?;
        }

        ep.connect()
            .await
            .map_err(|e| DialError::Unavailable(error_chain(&e)))
    }
}

/// Prefix a bare `host:port` with the scheme implied by `security`.
pub fn endpoint_uri(endpoint: &str, security: &TransportSecurity) -> String {
    if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("{}://{}", security.scheme(), endpoint)
    }
}

// tonic's transport error only says "transport error"; the cause is in the chain.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
