//! Health-check resolution and probing
//!
//! Maps an image reference to a probe spec from layered configuration and
//! executes HTTP or container-state readiness checks after a deploy stage.

mod probe;
mod resolver;

pub use probe::{probe_http, wait_ready_state};
pub use resolver::{HealthResolver, Probe};
