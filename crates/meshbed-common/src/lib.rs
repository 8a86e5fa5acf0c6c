//! # meshbed-common
//!
//! Shared types for the meshbed network sidecar.
//!
//! This crate provides functionality used across all meshbed crates:
//! - Container ID validation
//! - Bandwidth quantity parsing
//! - Standard filesystem paths
//! - The network configuration data model delivered to sidecars
//! - Common error types

#![warn(missing_docs)]

pub mod bandwidth;
pub mod error;
pub mod id;
pub mod network;
pub mod paths;

pub use bandwidth::Bandwidth;
pub use error::{MeshbedError, MeshbedResult};
pub use id::ContainerId;
pub use network::{
    FilterAction, LinkRule, LinkShape, NetworkConfig, PolicyAction, RoutingPolicy,
};
pub use paths::MeshbedPaths;
