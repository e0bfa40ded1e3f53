//! Process-wide progress registry
//!
//! Maps an operation key (a container name) to a progress record, enforces
//! single-writer leases, and carries the cooperative cancellation latch
//! observed by the engine at stage boundaries.

mod registry;

pub use registry::{ProgressLease, ProgressRecord, ProgressRegistry, Stage};
