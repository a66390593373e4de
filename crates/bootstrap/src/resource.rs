//! Conversion of a [`ResourceDescriptor`] into an OpenTelemetry [`Resource`].

use common::ResourceDescriptor;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    SERVICE_INSTANCE_ID, SERVICE_NAME, SERVICE_NAMESPACE, SERVICE_VERSION,
};

/// Attribute naming the export path a resource's telemetry travels through.
pub const EXPORTER_KEY: &str = "exporter";

/// Merge `descriptor` over the SDK default resource.
///
/// Descriptor values win on key collision; the typed fields win over entries
/// in `descriptor.attributes` with the same key. `exporter` labels the
/// pipeline (e.g. `"grpc"`, `"collector"`).
pub fn merged(descriptor: &ResourceDescriptor, exporter: &'static str) -> Resource {
    let mut attrs: Vec<KeyValue> = descriptor
        .attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();

    attrs.push(KeyValue::new(EXPORTER_KEY, exporter));
    attrs.push(KeyValue::new(SERVICE_NAME, descriptor.service_name.clone()));
    if let Some(ns) = &descriptor.service_namespace {
        attrs.push(KeyValue::new(SERVICE_NAMESPACE, ns.clone()));
    }
    if let Some(version) = &descriptor.service_version {
        attrs.push(KeyValue::new(SERVICE_VERSION, version.clone()));
    }
    if let Some(id) = &descriptor.instance_id {
        attrs.push(KeyValue::new(SERVICE_INSTANCE_ID, id.clone()));
    }

    // Later entries overwrite earlier ones with the same key.
    Resource::default().merge(&Resource::new(attrs))
}
