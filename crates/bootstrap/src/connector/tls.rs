//! Transport security selection for the collector channel.
//!
//! PEM material is parsed up front with `rustls-pemfile` so that a broken
//! certificate surfaces as a configuration error instead of a dial failure
//! that the connector would keep retrying.

use std::fmt;
use std::path::Path;

use common::TelemetryError;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// PEM-encoded client certificate chain and its private key.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// A single TLS client configuration for the collector connection.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Trusted CA bundle. When absent the platform roots are used.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Client certificate for mutual TLS.
    pub identity: Option<ClientIdentity>,
    /// Override for the server name checked against the certificate.
    pub domain: Option<String>,
}

impl TlsSettings {
    /// Load PEM files from disk.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Configuration`] if a file cannot be read, if
    /// only one half of the client identity is given, or if the PEM data does
    /// not parse.
    pub fn from_files(
        ca_cert: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self, TelemetryError> {
        let ca_cert_pem = ca_cert.map(read_pem).transpose()?;
        let identity = match (client_cert, client_key) {
            (Some(cert), Some(key)) => Some(ClientIdentity {
                cert_pem: read_pem(cert)?,
                key_pem: read_pem(key)?,
            }),
            (None, None) => None,
            _ => {
                return Err(TelemetryError::config(
                    "client certificate and client key must be provided together",
                ))
            }
        };
        let settings = Self {
            ca_cert_pem,
            identity,
            domain: None,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Parse every PEM blob once, rejecting empty or malformed material.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if let Some(ca) = &self.ca_cert_pem {
            parse_certs(ca, "CA certificate")?;
        }
        if let Some(identity) = &self.identity {
            parse_certs(&identity.cert_pem, "client certificate")?;
            rustls_pemfile::private_key(&mut std::io::BufReader::new(identity.key_pem.as_slice()))
                .map_err(|e| TelemetryError::config(format!("failed to read client key: {e}")))?
                .ok_or_else(|| TelemetryError::config("no private key found in client key PEM"))?;
        }
        Ok(())
    }

    /// Build the tonic TLS configuration for this setting.
    pub fn client_config(&self) -> ClientTlsConfig {
        let mut config = ClientTlsConfig::new();
        if let Some(ca) = &self.ca_cert_pem {
            config = config.ca_certificate(Certificate::from_pem(ca));
        }
        if let Some(identity) = &self.identity {
            config = config.identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem));
        }
        if let Some(domain) = &self.domain {
            config = config.domain_name(domain.clone());
        }
        config
    }
}

/// Security mode of the collector connection. At most one TLS configuration
/// is active per connection.
#[derive(Debug, Clone, Default)]
pub enum TransportSecurity {
    #[default]
    Insecure,
    Tls(TlsSettings),
}

impl TransportSecurity {
    /// Select the security mode from zero or one TLS configurations.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Configuration`] if more than one configuration
    /// is passed or if the single configuration fails validation.
    pub fn from_configs(configs: &[TlsSettings]) -> Result<Self, TelemetryError> {
        match configs {
            [] => Ok(TransportSecurity::Insecure),
            [tls] => {
                tls.validate()?;
                Ok(TransportSecurity::Tls(tls.clone()))
            }
            more => Err(TelemetryError::config(format!(
                "{} TLS configurations given; either one or none is accepted",
                more.len()
            ))),
        }
    }

    /// URI scheme used when the endpoint is given as bare `host:port`.
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportSecurity::Insecure => "http",
            TransportSecurity::Tls(_) => "https",
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TelemetryError> {
    std::fs::read(path)
        .map_err(|e| TelemetryError::config(format!("failed to read {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8], what: &str) -> Result<(), TelemetryError> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TelemetryError::config(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(TelemetryError::config(format!("no certificate found in {what} PEM")));
    }
    Ok(())
}
