//! The data interface of one container.

use std::collections::HashSet;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use meshbed_common::{FilterAction, LinkRule, LinkShape};

use crate::error::{NetworkError, NetworkResult};
use crate::netlink::{Family, LinkInfo, NetlinkBackend, Route, RouteKind, RouteScope, PROTO_KERNEL, PROTO_RULES};
use crate::tc;

/// Handle on a resolved interface plus its current shaping state.
///
/// [`shape`](Self::shape) and [`add_rules`](Self::add_rules) each replace
/// their half of the state and re-install the whole traffic-control tree and
/// the filter routes; nothing from a previous call survives.
#[derive(Clone)]
pub struct LinkManager {
    backend: Arc<dyn NetlinkBackend>,
    link: LinkInfo,
    shape: LinkShape,
    rules: Vec<LinkRule>,
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("link", &self.link)
            .field("shape", &self.shape)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl LinkManager {
    /// Find the interface called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::LinkResolutionFailed`] if there is no such
    /// interface.
    pub async fn resolve(backend: Arc<dyn NetlinkBackend>, name: &str) -> NetworkResult<Self> {
        let link = backend
            .link_by_name(name)
            .await?
            .ok_or_else(|| NetworkError::LinkResolutionFailed {
                name: name.to_string(),
                reason: "link not found".to_string(),
            })?;

        tracing::debug!(link = %link.name, index = link.index, "Resolved link");
        Ok(Self {
            backend,
            link,
            shape: LinkShape::default(),
            rules: Vec::new(),
        })
    }

    /// The interface.
    #[must_use]
    pub fn link(&self) -> &LinkInfo {
        &self.link
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// The installed default shape.
    #[must_use]
    pub fn current_shape(&self) -> &LinkShape {
        &self.shape
    }

    /// The installed rules.
    #[must_use]
    pub fn current_rules(&self) -> &[LinkRule] {
        &self.rules
    }

    /// IPv4 addresses of the interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn list_v4(&self) -> NetworkResult<Vec<Ipv4Net>> {
        let addrs = self.backend.addresses(&self.link, Family::V4).await?;
        Ok(addrs
            .into_iter()
            .filter_map(|net| match net {
                IpNet::V4(net) => Some(net),
                IpNet::V6(_) => None,
            })
            .collect())
    }

    /// IPv6 addresses of the interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend query fails.
    pub async fn list_v6(&self) -> NetworkResult<Vec<Ipv6Net>> {
        let addrs = self.backend.addresses(&self.link, Family::V6).await?;
        Ok(addrs
            .into_iter()
            .filter_map(|net| match net {
                IpNet::V6(net) => Some(net),
                IpNet::V4(_) => None,
            })
            .collect())
    }

    /// Replace the default shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is invalid or installation fails.
    pub async fn shape(&mut self, profile: &LinkShape) -> NetworkResult<()> {
        profile.validate()?;
        self.shape = profile.clone();
        self.install().await
    }

    /// Replace the rule list.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule is invalid or installation fails.
    pub async fn add_rules(&mut self, rules: &[LinkRule]) -> NetworkResult<()> {
        for rule in rules {
            rule.shape.validate()?;
        }
        self.rules = rules.to_vec();
        self.install().await
    }

    async fn install(&self) -> NetworkResult<()> {
        let commands = tc::plan(&self.shape, &self.rules)?;
        self.backend.traffic_control(&self.link, &commands).await?;

        let own_subnets = self.own_subnets().await?;
        let desired = filter_routes(&self.link, &self.shape, &own_subnets, &self.rules);

        for route in self.backend.routes().await? {
            if route.protocol == PROTO_RULES && !desired.contains(&route) {
                self.backend.delete_route(&route).await?;

                // A filter on the link's own subnet replaced the connected route.
                let restores_own = own_subnets.contains(&route.destination)
                    && !desired.iter().any(|r| r.destination == route.destination);
                if restores_own {
                    let connected = Route::new(route.destination)
                        .dev(self.link.index)
                        .scope(RouteScope::Link)
                        .protocol(PROTO_KERNEL);
                    self.backend.replace_route(&connected).await?;
                }
            }
        }
        for route in &desired {
            self.backend.replace_route(route).await?;
        }

        tracing::info!(
            link = %self.link.name,
            rules = self.rules.len(),
            filter_routes = desired.len(),
            "Installed link shaping"
        );
        Ok(())
    }

    async fn own_subnets(&self) -> NetworkResult<Vec<Ipv4Net>> {
        Ok(self.list_v4().await?.into_iter().map(|net| net.trunc()).collect())
    }
}

fn filter_route(subnet: Ipv4Net, action: FilterAction, link: &LinkInfo) -> Route {
    let route = Route::new(subnet.trunc()).protocol(PROTO_RULES);
    match action {
        FilterAction::Drop => route.kind(RouteKind::Blackhole),
        FilterAction::Reject => route.kind(RouteKind::Unreachable),
        FilterAction::Accept => route.dev(link.index).scope(RouteScope::Link),
    }
}

/// Routes that enforce the filter actions of the default shape and rules.
///
/// The first rule for a subnet wins. An `accept` rule only needs a route when
/// the link's own subnet is blocked, to punch a hole through it.
fn filter_routes(
    link: &LinkInfo,
    shape: &LinkShape,
    own_subnets: &[Ipv4Net],
    rules: &[LinkRule],
) -> Vec<Route> {
    let mut routes = Vec::new();
    let mut seen = HashSet::new();

    for rule in rules {
        let subnet = rule.subnet.trunc();
        if !seen.insert(subnet) {
            continue;
        }
        if rule.shape.filter == FilterAction::Accept && shape.filter == FilterAction::Accept {
            continue;
        }
        routes.push(filter_route(subnet, rule.shape.filter, link));
    }

    if shape.filter != FilterAction::Accept {
        for subnet in own_subnets {
            if seen.insert(*subnet) {
                routes.push(filter_route(*subnet, shape.filter, link));
            }
        }
    }

    routes
}
