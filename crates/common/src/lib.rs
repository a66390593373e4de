//! Shared error taxonomy and service identity types for the telemetry bootstrap crates.

pub mod descriptor;
pub mod error;

pub use descriptor::ResourceDescriptor;
pub use error::{DialError, TelemetryError};
