//! CNI invocation.
//!
//! The sidecar never creates the data interface itself: it asks a CNI plugin
//! to attach the container's namespace to the data network, and asks it again
//! to detach. Attach goes through the retry policy; detach is a single
//! attempt because retrying it against a half-removed namespace is unsafe.

pub mod config;
pub mod plugin;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use config::{ConfigKind, Ipam, IpamAddress, NetworkConfigList, PluginConf, PluginSettings, RuntimeConf};
pub use plugin::{CniInterface, CniIpConfig, CniPlugin, CniResult, ExecPlugin};

use crate::error::{NetworkError, NetworkResult};
use crate::retry::{RetryError, RetryPolicy};

/// Attaches and detaches namespaces through a [`CniPlugin`].
#[derive(Clone)]
pub struct CniInvoker {
    plugin: Arc<dyn CniPlugin>,
    settings: PluginSettings,
    policy: RetryPolicy,
}

impl CniInvoker {
    /// Create an invoker.
    #[must_use]
    pub fn new(plugin: Arc<dyn CniPlugin>, settings: PluginSettings, policy: RetryPolicy) -> Self {
        Self {
            plugin,
            settings,
            policy,
        }
    }

    /// The retry policy used for attach.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Build the config list for an allocation kind.
    #[must_use]
    pub fn build_config(&self, kind: &ConfigKind) -> NetworkConfigList {
        NetworkConfigList::build(kind, &self.settings)
    }

    /// Attach under the retry policy, bounded by its deadline.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::Timeout`] if the deadline elapses first, even with attempts left
    /// - [`NetworkError::Cancelled`] if `cancel` fires
    /// - [`NetworkError::AttachFailed`] if every attempt fails
    pub async fn attach(
        &self,
        cancel: &CancellationToken,
        netconf: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<CniResult> {
        self.policy
            .run(cancel, || self.plugin.add_network_list(netconf, rt))
            .await
            .map_err(|err| match err {
                RetryError::DeadlineElapsed { deadline } => NetworkError::Timeout { deadline },
                RetryError::Cancelled { .. } => NetworkError::Cancelled {
                    operation: "CNI attach".to_string(),
                },
                err @ RetryError::Exhausted { .. } => NetworkError::AttachFailed {
                    source: Box::new(err),
                },
            })
    }

    /// Detach with a single attempt.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::DetachFailed`] wrapping the plugin failure.
    pub async fn detach(&self, netconf: &NetworkConfigList, rt: &RuntimeConf) -> NetworkResult<()> {
        self.plugin
            .del_network_list(netconf, rt)
            .await
            .map_err(|err| NetworkError::DetachFailed {
                source: Box::new(err),
            })
    }
}
