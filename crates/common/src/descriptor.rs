//! Identity of the emitting service, attached to every metric and span.

use std::collections::BTreeMap;

use crate::error::TelemetryError;

/// Service identity attributes merged into the telemetry resource.
///
/// Immutable once handed to a pipeline builder; the builders take a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub service_name: String,
    pub service_namespace: Option<String>,
    pub service_version: Option<String>,
    pub instance_id: Option<String>,
    /// Additional attributes. Keys reserved by the fields above are overridden
    /// by those fields.
    pub attributes: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_namespace: None,
            service_version: None,
            instance_id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.service_namespace = Some(namespace.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Parse a `k=v,k=v` list into extra attributes.
    ///
    /// Empty segments are skipped; a segment without `=` or with an empty key
    /// is rejected.
    pub fn with_attribute_list(mut self, list: &str) -> Result<Self, TelemetryError> {
        for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                TelemetryError::config(format!("resource attribute `{pair}` is not key=value"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(TelemetryError::config(format!(
                    "resource attribute `{pair}` has an empty key"
                )));
            }
            self.attributes.insert(key.to_owned(), value.trim().to_owned());
        }
        Ok(self)
    }

    /// Reject descriptors that would produce an anonymous resource.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.service_name.trim().is_empty() {
            return Err(TelemetryError::config("service name must not be empty"));
        }
        Ok(())
    }
}
