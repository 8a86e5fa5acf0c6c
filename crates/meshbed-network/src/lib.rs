//! # meshbed-network
//!
//! Data-network management for one container.
//!
//! This crate provides:
//! - CNI invocation with bounded retries (`cni`, `retry`)
//! - Kernel access inside a network namespace (`netlink`)
//! - Link shaping and filter rules (`link`, `tc`)
//! - Routing policy that keeps the control plane reachable (`routing`)
//! - The per-container state machine tying it together (`configurator`)

#![warn(missing_docs)]

pub mod cni;
pub mod configurator;
pub mod error;
pub mod link;
pub mod netlink;
pub mod retry;
pub mod routing;
pub mod tc;

pub use cni::{CniInvoker, CniPlugin, ConfigKind, ExecPlugin, PluginSettings};
pub use configurator::{ActiveLink, ConfigureWarning, ConfiguratorSettings, NetworkConfigurator};
pub use error::{NetworkError, NetworkResult};
pub use link::LinkManager;
pub use netlink::{NetlinkBackend, NetnsHandle};
pub use retry::{RetryError, RetryPolicy, retry};
pub use routing::{ExternalRoutes, RoutingPolicyEngine};
