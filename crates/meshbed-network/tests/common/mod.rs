//! In-memory fakes of the CNI plugin and the kernel namespace.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use meshbed_common::ContainerId;
use meshbed_network::cni::{CniPlugin, CniResult, Ipam, NetworkConfigList, RuntimeConf};
use meshbed_network::netlink::{
    Family, LinkInfo, NetlinkBackend, Route, RouteScope, PROTO_KERNEL,
};
use meshbed_network::tc::TcCommand;
use meshbed_network::{
    CniInvoker, ConfiguratorSettings, NetworkConfigurator, NetworkError, NetworkResult,
    PluginSettings, RetryPolicy,
};
use parking_lot::Mutex;

pub const CONTROL_INDEX: u32 = 2;
pub const DATA_INDEX: u32 = 7;

pub fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

/// The control-plane routes every fake namespace starts with.
pub fn control_routes() -> Vec<Route> {
    vec![
        Route::new(net("172.17.0.0/16"))
            .dev(CONTROL_INDEX)
            .scope(RouteScope::Link)
            .protocol(PROTO_KERNEL),
        Route::new(net("0.0.0.0/0"))
            .via(Ipv4Addr::new(172, 17, 0, 1))
            .dev(CONTROL_INDEX),
    ]
}

#[derive(Debug, Default)]
struct NsState {
    links: HashMap<String, LinkInfo>,
    addrs: HashMap<u32, Vec<IpNet>>,
    routes: Vec<Route>,
    tc: HashMap<String, Vec<TcCommand>>,
    closes: u32,
}

/// A network namespace kept in memory.
#[derive(Debug)]
pub struct FakeNetns {
    state: Mutex<NsState>,
}

impl FakeNetns {
    pub fn new() -> Arc<Self> {
        let mut state = NsState::default();
        state.links.insert(
            "eth0".to_string(),
            LinkInfo {
                index: CONTROL_INDEX,
                name: "eth0".to_string(),
            },
        );
        state.routes = control_routes();
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Bring up the data interface with the given addresses.
    pub fn plug(&self, if_name: &str, addrs: &[Ipv4Net]) {
        let mut state = self.state.lock();
        state.links.insert(
            if_name.to_string(),
            LinkInfo {
                index: DATA_INDEX,
                name: if_name.to_string(),
            },
        );
        state
            .addrs
            .insert(DATA_INDEX, addrs.iter().copied().map(IpNet::V4).collect());
        for addr in addrs {
            let connected = Route::new(addr.trunc())
                .dev(DATA_INDEX)
                .scope(RouteScope::Link)
                .protocol(PROTO_KERNEL);
            if !state.routes.contains(&connected) {
                state.routes.push(connected);
            }
        }
    }

    /// Remove the data interface and everything attached to it.
    pub fn unplug(&self, if_name: &str) {
        let mut state = self.state.lock();
        if state.links.remove(if_name).is_some() {
            state.addrs.remove(&DATA_INDEX);
            state.routes.retain(|r| r.oif != Some(DATA_INDEX));
            state.tc.remove(if_name);
        }
    }

    pub fn route_table(&self) -> Vec<Route> {
        self.state.lock().routes.clone()
    }

    pub fn has_route(&self, destination: &str) -> bool {
        let destination = net(destination);
        self.state
            .lock()
            .routes
            .iter()
            .any(|r| r.destination == destination)
    }

    pub fn tc_commands(&self, if_name: &str) -> Vec<TcCommand> {
        self.state.lock().tc.get(if_name).cloned().unwrap_or_default()
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }
}

fn same_key(a: &Route, b: &Route) -> bool {
    a.destination == b.destination && a.metric == b.metric
}

#[async_trait]
impl NetlinkBackend for FakeNetns {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        Ok(self.state.lock().links.get(name).cloned())
    }

    async fn addresses(&self, link: &LinkInfo, family: Family) -> NetworkResult<Vec<IpNet>> {
        let state = self.state.lock();
        Ok(state
            .addrs
            .get(&link.index)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter(|a| matches!((a, family), (IpNet::V4(_), Family::V4) | (IpNet::V6(_), Family::V6)))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn routes(&self) -> NetworkResult<Vec<Route>> {
        Ok(self.route_table())
    }

    async fn replace_route(&self, route: &Route) -> NetworkResult<()> {
        let mut state = self.state.lock();
        state.routes.retain(|r| !same_key(r, route));
        state.routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> NetworkResult<()> {
        self.state.lock().routes.retain(|r| r != route);
        Ok(())
    }

    async fn traffic_control(&self, link: &LinkInfo, commands: &[TcCommand]) -> NetworkResult<()> {
        self.state
            .lock()
            .tc
            .insert(link.name.clone(), commands.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closes += 1;
    }
}

/// One recorded plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(Ipam),
    Del,
}

/// A CNI plugin that plugs interfaces into a [`FakeNetns`].
pub struct FakeCni {
    netns: Arc<FakeNetns>,
    calls: Mutex<Vec<Call>>,
    pool_next: Mutex<u8>,
    addresses_per_attach: usize,
    fail_adds: Mutex<u32>,
    fail_dels: Mutex<bool>,
}

impl FakeCni {
    pub fn new(netns: Arc<FakeNetns>) -> Arc<Self> {
        Self::with_addresses(netns, 1)
    }

    /// A plugin that assigns `count` addresses per attach.
    pub fn with_addresses(netns: Arc<FakeNetns>, count: usize) -> Arc<Self> {
        Arc::new(Self {
            netns,
            calls: Mutex::new(Vec::new()),
            pool_next: Mutex::new(2),
            addresses_per_attach: count,
            fail_adds: Mutex::new(0),
            fail_dels: Mutex::new(false),
        })
    }

    pub fn fail_next_adds(&self, n: u32) {
        *self.fail_adds.lock() = n;
    }

    pub fn fail_dels(&self, fail: bool) {
        *self.fail_dels.lock() = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn adds(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Add(_))).count()
    }

    pub fn dels(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Del)).count()
    }

    fn allocate(&self, ipam: &Ipam) -> Vec<Ipv4Net> {
        let first = match ipam {
            Ipam::Fixed { ips } => ips[0].address,
            Ipam::Pool { subnet } => {
                let mut next = self.pool_next.lock();
                let octets = subnet.network().octets();
                let addr = Ipv4Addr::new(octets[0], octets[1], 0, *next);
                *next += 1;
                Ipv4Net::new(addr, subnet.prefix_len()).unwrap()
            }
            Ipam::Other(_) => panic!("unexpected IPAM config"),
        };

        (0..self.addresses_per_attach)
            .map(|i| {
                let octets = first.addr().octets();
                let last = octets[3] + u8::try_from(i).unwrap() * 100;
                Ipv4Net::new(
                    Ipv4Addr::new(octets[0], octets[1], octets[2], last),
                    first.prefix_len(),
                )
                .unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl CniPlugin for FakeCni {
    async fn add_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<CniResult> {
        let ipam = list.plugins[0].ipam.clone().unwrap();
        self.calls.lock().push(Call::Add(ipam.clone()));

        {
            let mut fail = self.fail_adds.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(NetworkError::Plugin {
                    plugin: "fake".to_string(),
                    code: 11,
                    message: "try again later".to_string(),
                });
            }
        }

        let addrs = self.allocate(&ipam);
        self.netns.plug(&rt.if_name, &addrs);
        Ok(CniResult::default())
    }

    async fn del_network_list(
        &self,
        _list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<()> {
        self.calls.lock().push(Call::Del);
        if *self.fail_dels.lock() {
            return Err(NetworkError::Plugin {
                plugin: "fake".to_string(),
                code: 0,
                message: "namespace busy".to_string(),
            });
        }
        self.netns.unplug(&rt.if_name);
        Ok(())
    }
}

/// A configurator wired to fresh fakes.
pub struct Harness {
    pub netns: Arc<FakeNetns>,
    pub cni: Arc<FakeCni>,
    pub configurator: NetworkConfigurator,
}

impl Harness {
    pub fn new() -> Self {
        let netns = FakeNetns::new();
        Self::with_cni(Arc::clone(&netns), FakeCni::new(netns))
    }

    pub fn with_cni(netns: Arc<FakeNetns>, cni: Arc<FakeCni>) -> Self {
        let invoker = CniInvoker::new(cni.clone(), PluginSettings::default(), RetryPolicy::default());
        let configurator = NetworkConfigurator::new(
            ContainerId::new("c0ffee").unwrap(),
            "/proc/42/ns/net",
            ConfiguratorSettings::default(),
            invoker,
            netns.clone(),
        );
        Self {
            netns,
            cni,
            configurator,
        }
    }
}
