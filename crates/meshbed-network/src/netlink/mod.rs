//! Kernel network state inside a container's namespace.
//!
//! Everything the sidecar reads or writes in the kernel goes through
//! [`NetlinkBackend`]. [`NetnsHandle`] is the production implementation.

mod netns;

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

pub use netns::NetnsHandle;

use crate::error::NetworkResult;
use crate::tc::TcCommand;

/// Route protocol tag for routes installed by the routing policy.
pub const PROTO_POLICY: u8 = 0xa1;

/// Route protocol tag for routes installed by link filter rules.
pub const PROTO_RULES: u8 = 0xa2;

/// Route protocol of routes added by the kernel itself.
pub const PROTO_KERNEL: u8 = 2;

/// Route protocol of routes added by an administrator or plugin.
pub const PROTO_BOOT: u8 = 3;

/// A network interface inside the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkInfo {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
}

/// Address family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// Route scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RouteScope {
    /// Reachable through a gateway.
    #[default]
    Universe,
    /// Directly attached.
    Link,
    /// Local to this host.
    Host,
}

/// Route type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Regular forwarding route.
    #[default]
    Unicast,
    /// Silently discard.
    Blackhole,
    /// Discard and answer with ICMP unreachable.
    Unreachable,
}

/// An IPv4 main-table route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination prefix.
    pub destination: Ipv4Net,
    /// Next hop.
    pub gateway: Option<Ipv4Addr>,
    /// Output interface index.
    pub oif: Option<u32>,
    /// Scope.
    pub scope: RouteScope,
    /// Metric.
    pub metric: Option<u32>,
    /// Type.
    pub kind: RouteKind,
    /// Protocol (origin) tag.
    pub protocol: u8,
}

impl Route {
    /// A unicast route with boot protocol and no next hop.
    #[must_use]
    pub fn new(destination: Ipv4Net) -> Self {
        Self {
            destination,
            gateway: None,
            oif: None,
            scope: RouteScope::Universe,
            metric: None,
            kind: RouteKind::Unicast,
            protocol: PROTO_BOOT,
        }
    }

    /// Set the gateway.
    #[must_use]
    pub fn via(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the output interface.
    #[must_use]
    pub fn dev(mut self, oif: u32) -> Self {
        self.oif = Some(oif);
        self
    }

    /// Set the scope.
    #[must_use]
    pub fn scope(mut self, scope: RouteScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the type.
    #[must_use]
    pub fn kind(mut self, kind: RouteKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the protocol tag.
    #[must_use]
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Whether this is the default route.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    /// Whether meshbed installed this route.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.protocol == PROTO_POLICY || self.protocol == PROTO_RULES
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RouteKind::Unicast => write!(f, "{}", self.destination)?,
            RouteKind::Blackhole => write!(f, "blackhole {}", self.destination)?,
            RouteKind::Unreachable => write!(f, "unreachable {}", self.destination)?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(oif) = self.oif {
            write!(f, " dev #{oif}")?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

/// Kernel operations needed by the sidecar, scoped to one namespace.
#[async_trait]
pub trait NetlinkBackend: Send + Sync {
    /// Look up an interface by name; `None` if it does not exist.
    async fn link_by_name(&self, name: &str) -> NetworkResult<Option<LinkInfo>>;

    /// Addresses currently assigned to an interface.
    async fn addresses(&self, link: &LinkInfo, family: Family) -> NetworkResult<Vec<IpNet>>;

    /// IPv4 routes of the main table.
    async fn routes(&self) -> NetworkResult<Vec<Route>>;

    /// Install a route, replacing any route with the same key.
    async fn replace_route(&self, route: &Route) -> NetworkResult<()>;

    /// Remove a route; removing an absent route succeeds.
    async fn delete_route(&self, route: &Route) -> NetworkResult<()>;

    /// Remove the interface's root qdisc tree and install `commands` in order.
    async fn traffic_control(&self, link: &LinkInfo, commands: &[TcCommand]) -> NetworkResult<()>;

    /// Release the underlying kernel handle. Safe to call more than once.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_display() {
        let route = Route::new("0.0.0.0/0".parse().unwrap())
            .via(Ipv4Addr::new(10, 0, 0, 1))
            .dev(2);
        assert_eq!(route.to_string(), "0.0.0.0/0 via 10.0.0.1 dev #2");
        assert!(route.is_default());
        assert!(!route.is_managed());

        let route = Route::new("16.0.2.0/24".parse().unwrap())
            .kind(RouteKind::Blackhole)
            .protocol(PROTO_RULES);
        assert_eq!(route.to_string(), "blackhole 16.0.2.0/24");
        assert!(route.is_managed());
    }
}
