//! Container descriptors
//!
//! The normalized, serializable representation of a container's runtime
//! configuration: produced by introspection, reshaped by environment
//! transforms, and consumed by every deployment strategy.

mod introspect;
mod transform;
mod types;
mod yaml;

pub use introspect::introspect;
pub use transform::transform;
pub use types::{
    ContainerDescriptor, EnvProfile, Environment, MountSpec, PortMode, RestartPolicy,
};
pub use yaml::{export_yaml, import_yaml};
