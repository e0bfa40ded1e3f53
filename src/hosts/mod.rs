//! Host registry and authentication
//!
//! Persists host records with secrets encrypted at rest, and resolves a host
//! id to an authenticated Docker client — the local daemon socket, or a
//! remote daemon reached through an SSH tunnel.

mod record;
mod registry;
mod secrets;
mod ssh;

pub use record::{AuthKind, HostRecord, SecretMaterial, LOCAL_HOST_ID};
pub use registry::{AuthenticatedClient, HostRegistry};
pub use secrets::SecretStore;
