//! rtnetlink and `tc` backend bound to one network namespace.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroI32;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::{IpNet, Ipv4Net};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope as NlRouteScope,
    RouteType,
};
use rtnetlink::RouteMessageBuilder;
use rustix::thread::LinkNameSpaceType;

use super::{Family, LinkInfo, NetlinkBackend, Route, RouteKind, RouteScope};
use crate::error::{NetworkError, NetworkResult};
use crate::tc::TcCommand;

const MAIN_TABLE: u32 = 254;

/// A netlink connection opened inside a container's network namespace.
///
/// The socket is created on a short-lived thread that has joined the target
/// namespace; a netlink socket stays bound to the namespace it was created
/// in, so the rest of the process never has to switch namespaces. `tc` runs
/// through `nsenter`.
pub struct NetnsHandle {
    netns: PathBuf,
    handle: rtnetlink::Handle,
    conn_task: tokio::task::JoinHandle<()>,
}

impl NetnsHandle {
    /// Open a handle on the namespace at `netns` (e.g. `/proc/<pid>/ns/net`).
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be joined or the netlink
    /// socket cannot be created.
    pub async fn open(netns: impl Into<PathBuf>) -> NetworkResult<Self> {
        let netns = netns.into();
        let runtime = tokio::runtime::Handle::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let path = netns.clone();
        std::thread::spawn(move || {
            let _ = tx.send(connect_in(&path, &runtime));
        });

        let (handle, conn_task) = rx
            .await
            .map_err(|_| NetworkError::backend("namespace thread exited before connecting"))??;

        tracing::debug!(netns = %netns.display(), "Opened netlink handle in namespace");
        Ok(Self {
            netns,
            handle,
            conn_task,
        })
    }

    /// Path of the namespace this handle is bound to.
    #[must_use]
    pub fn netns(&self) -> &Path {
        &self.netns
    }

    async fn run_tc(&self, args: &[String]) -> NetworkResult<()> {
        let output = tokio::process::Command::new("nsenter")
            .arg(format!("--net={}", self.netns.display()))
            .arg("tc")
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(NetworkError::TrafficControl {
                command: format!("tc {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn connect_in(
    netns: &Path,
    runtime: &tokio::runtime::Handle,
) -> NetworkResult<(rtnetlink::Handle, tokio::task::JoinHandle<()>)> {
    let file = std::fs::File::open(netns)?;
    rustix::thread::move_into_link_name_space(file.as_fd(), Some(LinkNameSpaceType::Network))
        .map_err(std::io::Error::from)?;

    let _guard = runtime.enter();
    let (conn, handle, _) = rtnetlink::new_connection()?;
    let conn_task = runtime.spawn(conn);
    Ok((handle, conn_task))
}

fn netlink_error(operation: &str) -> impl FnOnce(rtnetlink::Error) -> NetworkError + '_ {
    move |source| NetworkError::Netlink {
        operation: operation.to_string(),
        source,
    }
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.code.map(NonZeroI32::get) == Some(-errno))
}

fn scope_to_netlink(scope: RouteScope) -> NlRouteScope {
    match scope {
        RouteScope::Universe => NlRouteScope::Universe,
        RouteScope::Link => NlRouteScope::Link,
        RouteScope::Host => NlRouteScope::Host,
    }
}

fn kind_to_netlink(kind: RouteKind) -> RouteType {
    match kind {
        RouteKind::Unicast => RouteType::Unicast,
        RouteKind::Blackhole => RouteType::BlackHole,
        RouteKind::Unreachable => RouteType::Unreachable,
    }
}

fn route_message(route: &Route) -> RouteMessage {
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
        .destination_prefix(route.destination.network(), route.destination.prefix_len())
        .scope(scope_to_netlink(route.scope))
        .kind(kind_to_netlink(route.kind))
        .protocol(RouteProtocol::from(route.protocol));

    if let Some(gateway) = route.gateway {
        builder = builder.gateway(gateway);
    }
    if let Some(oif) = route.oif {
        builder = builder.output_interface(oif);
    }
    if let Some(metric) = route.metric {
        builder = builder.priority(metric);
    }
    builder.build()
}

/// Convert a kernel route; `None` for non-IPv4, non-main-table or
/// unsupported route types.
fn route_from_message(msg: &RouteMessage) -> Option<Route> {
    let kind = match msg.header.kind {
        RouteType::Unicast => RouteKind::Unicast,
        RouteType::BlackHole => RouteKind::Blackhole,
        RouteType::Unreachable => RouteKind::Unreachable,
        _ => return None,
    };
    let scope = match msg.header.scope {
        NlRouteScope::Universe => RouteScope::Universe,
        NlRouteScope::Link => RouteScope::Link,
        NlRouteScope::Host => RouteScope::Host,
        _ => return None,
    };

    let mut table = u32::from(msg.header.table);
    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut gateway = None;
    let mut oif = None;
    let mut metric = None;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(t) => table = *t,
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => destination = *addr,
            RouteAttribute::Destination(_) => return None,
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::Priority(p) => metric = Some(*p),
            _ => {}
        }
    }

    if table != MAIN_TABLE {
        return None;
    }

    let destination = Ipv4Net::new(destination, msg.header.destination_prefix_length).ok()?;
    Some(Route {
        destination,
        gateway,
        oif,
        scope,
        metric,
        kind,
        protocol: u8::from(msg.header.protocol),
    })
}

#[async_trait]
impl NetlinkBackend for NetnsHandle {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(LinkInfo {
                index: msg.header.index,
                name: name.to_string(),
            })),
            Ok(None) => Ok(None),
            Err(err) if is_errno(&err, libc::ENODEV) => Ok(None),
            Err(err) => Err(netlink_error("link get")(err)),
        }
    }

    async fn addresses(&self, link: &LinkInfo, family: Family) -> NetworkResult<Vec<IpNet>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(netlink_error("address get"))? {
            for attr in &msg.attributes {
                let AddressAttribute::Address(ip) = attr else {
                    continue;
                };
                let wanted = matches!(
                    (ip, family),
                    (IpAddr::V4(_), Family::V4) | (IpAddr::V6(_), Family::V6)
                );
                if wanted {
                    if let Ok(net) = IpNet::new(*ip, msg.header.prefix_len) {
                        addrs.push(net);
                    }
                }
            }
        }
        Ok(addrs)
    }

    async fn routes(&self) -> NetworkResult<Vec<Route>> {
        let request = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut stream = self.handle.route().get(request).execute();

        let mut routes = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(netlink_error("route get"))? {
            if let Some(route) = route_from_message(&msg) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    async fn replace_route(&self, route: &Route) -> NetworkResult<()> {
        tracing::debug!(route = %route, netns = %self.netns.display(), "Installing route");
        self.handle
            .route()
            .add(route_message(route))
            .replace()
            .execute()
            .await
            .map_err(netlink_error("route replace"))
    }

    async fn delete_route(&self, route: &Route) -> NetworkResult<()> {
        tracing::debug!(route = %route, netns = %self.netns.display(), "Removing route");
        match self.handle.route().del(route_message(route)).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::ESRCH) => Ok(()),
            Err(err) => Err(netlink_error("route delete")(err)),
        }
    }

    async fn traffic_control(&self, link: &LinkInfo, commands: &[TcCommand]) -> NetworkResult<()> {
        let reset = TcCommand::reset_root();
        if let Err(err) = self.run_tc(&reset.args(&link.name)).await {
            tracing::debug!(link = %link.name, error = %err, "No root qdisc to remove");
        }

        for command in commands {
            self.run_tc(&command.args(&link.name)).await?;
        }
        Ok(())
    }

    fn close(&self) {
        self.conn_task.abort();
    }
}

impl Drop for NetnsHandle {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_message_round_trips_through_parser() {
        let route = Route::new("16.0.2.0/24".parse().unwrap())
            .via(Ipv4Addr::new(16, 0, 0, 1))
            .dev(3)
            .protocol(super::super::PROTO_POLICY);
        let parsed = route_from_message(&route_message(&route)).unwrap();
        assert_eq!(parsed, route);
    }

    #[test]
    fn unreachable_route_message() {
        let route = Route::new("8.8.8.8/32".parse().unwrap()).kind(RouteKind::Unreachable);
        let msg = route_message(&route);
        assert_eq!(msg.header.kind, RouteType::Unreachable);
        assert_eq!(msg.header.destination_prefix_length, 32);
    }

    #[test]
    fn route_message_matches_rtnetlink_builder() {
        let route = Route::new("16.0.0.0/16".parse().unwrap())
            .dev(7)
            .scope(RouteScope::Link)
            .protocol(super::super::PROTO_RULES);

        let expected: RouteMessage = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(Ipv4Addr::new(16, 0, 0, 0), 16)
            .scope(NlRouteScope::Link)
            .kind(RouteType::Unicast)
            .protocol(RouteProtocol::from(super::super::PROTO_RULES))
            .output_interface(7)
            .build();
        assert_eq!(route_message(&route), expected);
    }
}
