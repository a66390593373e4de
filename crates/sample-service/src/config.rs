//! Configuration loading and validation for the sample service.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message if a required variable is missing or invalid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bootstrap::traces::CollectorAuth;
use bootstrap::{
    BackoffPolicy, BatchConfig, MetricsPipelineConfig, RetryLimit, TlsSettings,
    TracePipelineConfig,
};
use common::ResourceDescriptor;
use serde::Deserialize;

/// Validated sample-service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Collector address, `host:port` or a full `http(s)://` URI. **Required.**
    pub otel_collector_endpoint: String,

    /// `service.name` resource attribute. **Required.**
    pub service_name: String,

    #[serde(default)]
    pub service_namespace: Option<String>,

    #[serde(default = "default_service_version")]
    pub service_version: String,

    /// Defaults to a fresh UUID per process.
    #[serde(default = "default_instance_id")]
    pub service_instance_id: String,

    /// Extra resource attributes as `key=value,key=value`.
    #[serde(default)]
    pub resource_attributes: Option<String>,

    #[serde(default = "default_collect_period")]
    pub metrics_collect_period_secs: u64,

    #[serde(default = "default_metrics_export_timeout")]
    pub metrics_export_timeout_secs: u64,

    /// When `false` the no-op trace pipeline is installed.
    #[serde(default = "default_tracing_enabled")]
    pub tracing_enabled: bool,

    #[serde(default = "default_sampling_ratio")]
    pub trace_sampling_ratio: f64,

    /// Honeycomb credentials; both or neither.
    #[serde(default)]
    pub honeycomb_api_key: Option<String>,
    #[serde(default)]
    pub honeycomb_dataset: Option<String>,

    #[serde(default)]
    pub tls_ca_cert_path: Option<String>,
    #[serde(default)]
    pub tls_client_cert_path: Option<String>,
    #[serde(default)]
    pub tls_client_key_path: Option<String>,
    /// Overrides the server name checked against the collector certificate.
    #[serde(default)]
    pub tls_domain: Option<String>,

    /// Retry bound by attempt count. Mutually exclusive with `connect_max_elapsed_secs`.
    #[serde(default)]
    pub connect_max_attempts: Option<u32>,
    #[serde(default)]
    pub connect_max_elapsed_secs: Option<u64>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_collect_period() -> u64 {
    30
}
fn default_metrics_export_timeout() -> u64 {
    5
}
fn default_tracing_enabled() -> bool {
    true
}
fn default_sampling_ratio() -> f64 {
    1.0
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.otel_collector_endpoint, "OTEL_COLLECTOR_ENDPOINT")?;
        ensure_non_empty(&self.service_name, "SERVICE_NAME")?;

        if self.metrics_collect_period_secs == 0 {
            anyhow::bail!("METRICS_COLLECT_PERIOD_SECS must be >= 1");
        }
        if self.metrics_export_timeout_secs == 0 {
            anyhow::bail!("METRICS_EXPORT_TIMEOUT_SECS must be > 0");
        }
        if !(0.0..=1.0).contains(&self.trace_sampling_ratio) {
            anyhow::bail!("TRACE_SAMPLING_RATIO must be within [0, 1]");
        }
        if present(&self.honeycomb_api_key).is_some() != present(&self.honeycomb_dataset).is_some() {
            anyhow::bail!("HONEYCOMB_API_KEY and HONEYCOMB_DATASET must be set together");
        }
        if self.connect_max_attempts.is_some() && self.connect_max_elapsed_secs.is_some() {
            anyhow::bail!("set at most one of CONNECT_MAX_ATTEMPTS and CONNECT_MAX_ELAPSED_SECS");
        }
        if self.connect_max_attempts == Some(0) || self.connect_max_elapsed_secs == Some(0) {
            anyhow::bail!("connect retry bound must be > 0");
        }
        if self.shutdown_timeout_secs == 0 {
            anyhow::bail!("SHUTDOWN_TIMEOUT_SECS must be > 0");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("HEARTBEAT_INTERVAL_SECS must be > 0");
        }
        Ok(())
    }

    pub fn resource(&self) -> Result<ResourceDescriptor> {
        let mut descriptor = ResourceDescriptor::new(&self.service_name)
            .with_version(&self.service_version)
            .with_instance_id(&self.service_instance_id);
        if let Some(ns) = present(&self.service_namespace) {
            descriptor = descriptor.with_namespace(ns);
        }
        if let Some(list) = present(&self.resource_attributes) {
            descriptor = descriptor
                .with_attribute_list(list)
                .context("invalid RESOURCE_ATTRIBUTES")?;
        }
        Ok(descriptor)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::default();
        match (self.connect_max_attempts, self.connect_max_elapsed_secs) {
            (_, Some(secs)) => {
                policy.with_limit(RetryLimit::MaxElapsed(Duration::from_secs(secs)))
            }
            (Some(n), None) => policy.with_limit(RetryLimit::MaxAttempts(n)),
            (None, None) => policy,
        }
    }

    /// TLS selection for the connector: empty for plaintext, one entry otherwise.
    pub fn tls_settings(&self) -> Result<Vec<TlsSettings>> {
        let ca = present(&self.tls_ca_cert_path);
        let cert = present(&self.tls_client_cert_path);
        let key = present(&self.tls_client_key_path);
        let domain = present(&self.tls_domain);
        if ca.is_none() && cert.is_none() && key.is_none() && domain.is_none() {
            return Ok(Vec::new());
        }

        let mut settings = TlsSettings::from_files(ca.map(Path::new), cert.map(Path::new), key.map(Path::new))
            .context("invalid collector TLS material")?;
        if let Some(domain) = domain {
            settings = settings.with_domain(domain);
        }
        Ok(vec![settings])
    }

    pub fn metrics_config(&self) -> Result<MetricsPipelineConfig> {
        Ok(MetricsPipelineConfig::new(self.resource()?)
            .with_collect_period(Duration::from_secs(self.metrics_collect_period_secs))
            .with_export_timeout(Duration::from_secs(self.metrics_export_timeout_secs)))
    }

    pub fn trace_config(&self) -> Result<TracePipelineConfig> {
        let mut cfg = TracePipelineConfig::new(self.resource()?)
            .with_sampling_ratio(self.trace_sampling_ratio)
            .with_batch(BatchConfig::default());
        if let (Some(key), Some(dataset)) = (
            present(&self.honeycomb_api_key),
            present(&self.honeycomb_dataset),
        ) {
            cfg = cfg.with_auth(CollectorAuth::new(key, dataset));
        }
        Ok(cfg)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Unset and blank variables are treated alike.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
