//! Routing policy reconciliation.
//!
//! The routes present right after the data interface comes up are captured
//! once as [`ExternalRoutes`]. Every [`apply`](RoutingPolicyEngine::apply)
//! derives the full desired route set from that snapshot and the policy, so
//! the control-plane path captured in the baseline is never isolated away and
//! nothing from a previous policy lingers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use meshbed_common::{PolicyAction, RoutingPolicy};

use crate::error::NetworkResult;
use crate::netlink::{
    LinkInfo, NetlinkBackend, Route, RouteKind, RouteScope, PROTO_POLICY, PROTO_RULES,
};

/// Routes present in the namespace before any policy was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRoutes {
    link_index: u32,
    baseline: Vec<Route>,
    default_route: Option<Route>,
    captured_at: DateTime<Utc>,
}

impl ExternalRoutes {
    /// Build a snapshot of the routes seen when the data interface
    /// `link_index` came up. Routes installed by meshbed are ignored; the
    /// default route is kept apart from the baseline.
    #[must_use]
    pub fn from_routes(link_index: u32, routes: impl IntoIterator<Item = Route>) -> Self {
        let mut baseline = Vec::new();
        let mut default_route = None;

        for route in routes {
            if route.is_managed() || route.kind != RouteKind::Unicast {
                continue;
            }
            if route.is_default() {
                default_route.get_or_insert(route);
            } else {
                baseline.push(route);
            }
        }

        Self {
            link_index,
            baseline,
            default_route,
            captured_at: Utc::now(),
        }
    }

    /// Index of the data interface.
    #[must_use]
    pub fn link_index(&self) -> u32 {
        self.link_index
    }

    /// Non-default routes that must stay reachable.
    #[must_use]
    pub fn baseline(&self) -> &[Route] {
        &self.baseline
    }

    /// The uplink, if the namespace had one.
    #[must_use]
    pub fn default_route(&self) -> Option<&Route> {
        self.default_route.as_ref()
    }

    /// Fall back to `uplink` when the snapshot has no default route.
    ///
    /// A namespace that is reattached under a deny policy has already lost
    /// its default route by the time the new snapshot is taken.
    #[must_use]
    pub fn or_default_route(mut self, uplink: Option<&Route>) -> Self {
        if self.default_route.is_none() {
            self.default_route = uplink.cloned();
        }
        self
    }

    /// When the snapshot was taken.
    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn protects(&self, destination: &Ipv4Net) -> Option<&Route> {
        self.baseline
            .iter()
            .find(|route| route.destination.contains(destination))
    }
}

/// Installs routing policies against a captured baseline.
#[derive(Clone)]
pub struct RoutingPolicyEngine {
    backend: Arc<dyn NetlinkBackend>,
}

impl RoutingPolicyEngine {
    /// Create an engine for one namespace.
    #[must_use]
    pub fn new(backend: Arc<dyn NetlinkBackend>) -> Self {
        Self { backend }
    }

    /// Read the namespace's routes once.
    ///
    /// # Errors
    ///
    /// Returns an error if the route table cannot be read.
    pub async fn snapshot(&self, link: &LinkInfo) -> NetworkResult<ExternalRoutes> {
        let external = ExternalRoutes::from_routes(link.index, self.backend.routes().await?);
        tracing::debug!(
            link = %link.name,
            baseline = external.baseline.len(),
            has_default = external.default_route.is_some(),
            "Captured external routes"
        );
        Ok(external)
    }

    /// Install `policy`, re-deriving every route from `external`.
    ///
    /// # Errors
    ///
    /// Returns an error if a route cannot be read, removed or installed.
    pub async fn apply(&self, external: &ExternalRoutes, policy: &RoutingPolicy) -> NetworkResult<()> {
        let current = self.backend.routes().await?;

        // Filter routes on the data interface's own subnets take precedence
        // over the connected routes they replaced.
        let desired: Vec<Route> = derive_routes(external, policy)
            .into_iter()
            .filter(|route| {
                route.oif != Some(external.link_index)
                    || !current
                        .iter()
                        .any(|r| r.protocol == PROTO_RULES && r.destination == route.destination)
            })
            .collect();

        for route in current {
            let stale = (route.protocol == PROTO_POLICY || route.is_default())
                && !desired.contains(&route);
            if stale {
                self.backend.delete_route(&route).await?;
            }
        }

        for route in &desired {
            self.backend.replace_route(route).await?;
        }

        tracing::info!(
            policy = ?policy.default,
            exceptions = policy.exceptions.len(),
            routes = desired.len(),
            "Applied routing policy"
        );
        Ok(())
    }
}

/// The complete route set for a policy on top of a baseline.
#[must_use]
pub fn derive_routes(external: &ExternalRoutes, policy: &RoutingPolicy) -> Vec<Route> {
    let mut routes = external.baseline.clone();

    if policy.default == PolicyAction::Allow {
        if let Some(default_route) = &external.default_route {
            routes.push(default_route.clone());
        }
    }

    for exception in &policy.exceptions {
        let exception = exception.trunc();
        if let Some(protected) = external.protects(&exception) {
            tracing::warn!(
                exception = %exception,
                baseline = %protected,
                "Ignoring routing exception inside a protected route"
            );
            continue;
        }

        let route = match policy.default.inverse() {
            PolicyAction::Deny => Route::new(exception).kind(RouteKind::Unreachable),
            PolicyAction::Allow => {
                let Some(uplink) = &external.default_route else {
                    tracing::warn!(
                        exception = %exception,
                        "No default route captured; cannot allow exception"
                    );
                    continue;
                };
                let mut route = Route::new(exception);
                route.gateway = uplink.gateway;
                route.oif = uplink.oif;
                if route.gateway.is_none() {
                    route.scope = RouteScope::Link;
                }
                route
            }
        };
        routes.push(route.protocol(PROTO_POLICY));
    }

    routes
}
