//! Per-container network state machine.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use meshbed_common::{ContainerId, NetworkConfig};
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cni::{CniInvoker, ConfigKind, NetworkConfigList, RuntimeConf};
use crate::error::{NetworkError, NetworkResult};
use crate::link::LinkManager;
use crate::netlink::{NetlinkBackend, Route};
use crate::routing::{ExternalRoutes, RoutingPolicyEngine};

/// Static settings of a configurator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguratorSettings {
    /// The only network this sidecar manages.
    pub network: String,
    /// Name of the data interface inside the container.
    pub if_name: String,
    /// Pool addresses are allocated from when none is requested.
    pub subnet: Ipv4Net,
}

impl Default for ConfiguratorSettings {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            if_name: "eth1".to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(16, 0, 0, 0), 16).unwrap_or_default(),
        }
    }
}

impl ConfiguratorSettings {
    /// Set the managed network name.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Set the data interface name.
    #[must_use]
    pub fn with_if_name(mut self, if_name: impl Into<String>) -> Self {
        self.if_name = if_name.into();
        self
    }

    /// Set the allocation subnet.
    #[must_use]
    pub fn with_subnet(mut self, subnet: Ipv4Net) -> Self {
        self.subnet = subnet;
        self
    }
}

/// An attached data network.
#[derive(Debug, Clone)]
pub struct ActiveLink {
    /// The data interface.
    pub link: LinkManager,
    /// Address the interface came up with.
    pub ipv4: Option<Ipv4Net>,
    /// Always `None`.
    pub ipv6: Option<Ipv6Net>,
    /// Runtime record the plugin was invoked with.
    pub rt: RuntimeConf,
    /// Config list the plugin was invoked with.
    pub netconf: NetworkConfigList,
    /// Routes captured when the interface came up.
    pub external: ExternalRoutes,
    /// When the link was created.
    pub created_at: DateTime<Utc>,
}

/// Non-fatal findings recorded during configuration.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum ConfigureWarning {
    /// The data interface did not come up with exactly one IPv4 address.
    #[error("found {found} v4 addresses on {link}, expected {expected}")]
    #[diagnostic(code(meshbed::configure::address_count), severity(Warning))]
    AddressCount {
        /// Interface name.
        link: String,
        /// Expected count.
        expected: usize,
        /// Actual count.
        found: usize,
    },
}

/// Drives one container's managed networks towards their desired state.
pub struct NetworkConfigurator {
    container_id: ContainerId,
    netns: PathBuf,
    settings: ConfiguratorSettings,
    cni: CniInvoker,
    backend: Arc<dyn NetlinkBackend>,
    routing: RoutingPolicyEngine,
    active: BTreeMap<String, ActiveLink>,
    uplink: Option<Route>,
    warnings: Vec<ConfigureWarning>,
    closed: bool,
}

impl NetworkConfigurator {
    /// Create a configurator for a container's namespace.
    #[must_use]
    pub fn new(
        container_id: ContainerId,
        netns: impl Into<PathBuf>,
        settings: ConfiguratorSettings,
        cni: CniInvoker,
        backend: Arc<dyn NetlinkBackend>,
    ) -> Self {
        Self {
            container_id,
            netns: netns.into(),
            settings,
            cni,
            routing: RoutingPolicyEngine::new(Arc::clone(&backend)),
            backend,
            active: BTreeMap::new(),
            uplink: None,
            warnings: Vec::new(),
            closed: false,
        }
    }

    /// The container this configurator manages.
    #[must_use]
    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Path of the container's network namespace.
    #[must_use]
    pub fn netns(&self) -> &Path {
        &self.netns
    }

    /// Converge the container's network towards `cfg`.
    ///
    /// Safe to re-run with the same config: an online link with a matching
    /// address is never detached. There is no rollback; a failed call leaves
    /// whatever progress it made and a later call picks up from there.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::UnsupportedNetwork`] for networks other than the managed one
    /// - [`NetworkError::NotSupported`] if an IPv6 address is requested
    /// - [`NetworkError::Closed`] after [`close`](Self::close)
    /// - any CNI, link or routing failure
    #[tracing::instrument(skip_all, fields(container = %self.container_id.short(), network = %cfg.network))]
    pub async fn configure_network(
        &mut self,
        cancel: &CancellationToken,
        cfg: &NetworkConfig,
    ) -> NetworkResult<()> {
        if cfg.network != self.settings.network {
            return Err(NetworkError::UnsupportedNetwork {
                network: cfg.network.clone(),
                expected: self.settings.network.clone(),
            });
        }
        if cfg.ipv6.is_some() {
            return Err(NetworkError::NotSupported {
                feature: "ipv6".to_string(),
            });
        }
        if self.closed {
            return Err(NetworkError::Closed);
        }
        cfg.validate()?;

        let online = self.active.contains_key(&cfg.network);

        if !cfg.enable {
            if online {
                self.detach(&cfg.network).await?;
            }
            return Ok(());
        }

        if let (Some(link), Some(wanted)) = (self.active.get(&cfg.network), cfg.ipv4) {
            let current = link.ipv4.map(|net| net.addr());
            if current != Some(wanted.addr()) {
                tracing::info!(
                    current = ?current,
                    requested = %wanted,
                    "Reattaching to change address"
                );
                self.detach(&cfg.network).await?;
            }
        }

        if !self.active.contains_key(&cfg.network) {
            let link = self.attach(cancel, cfg).await?;
            self.active.insert(cfg.network.clone(), link);
        }

        let Some(link) = self.active.get_mut(&cfg.network) else {
            return Ok(());
        };
        link.link.shape(&cfg.default).await?;
        link.link.add_rules(&cfg.rules).await?;
        self.routing
            .apply(&link.external, &cfg.routing_policy)
            .await?;

        tracing::info!(ipv4 = ?link.ipv4, rules = cfg.rules.len(), "Network configured");
        Ok(())
    }

    async fn detach(&mut self, network: &str) -> NetworkResult<()> {
        let Some(link) = self.active.get(network) else {
            return Ok(());
        };
        self.cni.detach(&link.netconf, &link.rt).await?;
        self.active.remove(network);
        tracing::info!(network, "Detached network");
        Ok(())
    }

    async fn attach(
        &mut self,
        cancel: &CancellationToken,
        cfg: &NetworkConfig,
    ) -> NetworkResult<ActiveLink> {
        let kind = cfg
            .ipv4
            .map_or(ConfigKind::Subnet(self.settings.subnet), ConfigKind::Address);
        tracing::debug!(kind = %kind, "Attaching network");

        let netconf = self.cni.build_config(&kind);
        let rt = RuntimeConf::new(
            self.container_id.as_str(),
            &self.netns,
            &self.settings.if_name,
        );

        self.cni.attach(cancel, &netconf, &rt).await?;

        let link = LinkManager::resolve(Arc::clone(&self.backend), &self.settings.if_name).await?;
        let addrs = link.list_v4().await?;
        if addrs.len() != 1 {
            let warning = ConfigureWarning::AddressCount {
                link: link.name().to_string(),
                expected: 1,
                found: addrs.len(),
            };
            tracing::warn!(%warning, "Unexpected address count");
            self.warnings.push(warning);
        }
        let external = self
            .routing
            .snapshot(link.link())
            .await?
            .or_default_route(self.uplink.as_ref());
        if self.uplink.is_none() {
            self.uplink = external.default_route().cloned();
        }

        tracing::info!(ipv4 = ?addrs.first(), link = %link.name(), "Attached network");
        Ok(ActiveLink {
            ipv4: addrs.first().copied(),
            ipv6: None,
            link,
            rt,
            netconf,
            external,
            created_at: Utc::now(),
        })
    }

    /// Release the kernel handle. Attached networks stay attached.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.backend.close();
        self.closed = true;
        tracing::debug!(container = %self.container_id.short(), "Closed network handle");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Names of the online networks, sorted.
    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// An online network's link.
    #[must_use]
    pub fn active_link(&self, network: &str) -> Option<&ActiveLink> {
        self.active.get(network)
    }

    /// Warnings recorded since the last [`take_warnings`](Self::take_warnings).
    #[must_use]
    pub fn warnings(&self) -> &[ConfigureWarning] {
        &self.warnings
    }

    /// Drain the recorded warnings, so each one is reported once.
    pub fn take_warnings(&mut self) -> Vec<ConfigureWarning> {
        std::mem::take(&mut self.warnings)
    }
}
