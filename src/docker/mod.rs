//! Docker Engine API façade
//!
//! Exposes the operation subset the engines need, with typed failures and an
//! ephemeral-helper convenience for data-plane work.

mod client;

pub use client::{DockerClient, EphemeralOutput};
