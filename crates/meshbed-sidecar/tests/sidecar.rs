//! End-to-end event handling against fake plugins and namespaces.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use meshbed_common::{ContainerId, MeshbedPaths, NetworkConfig};
use meshbed_network::cni::{CniPlugin, CniResult, NetworkConfigList, RuntimeConf};
use meshbed_network::netlink::{Family, LinkInfo, NetlinkBackend, Route};
use meshbed_network::tc::TcCommand;
use meshbed_network::{
    CniInvoker, NetworkError, NetworkResult, PluginSettings, RetryPolicy,
};
use meshbed_sidecar::{
    BackendFactory, Outcome, SidecarConfig, StatusReport, StatusSink, Supervisor, serve,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<StatusReport>>,
}

#[async_trait]
impl StatusSink for Recorder {
    async fn report(&self, report: StatusReport) {
        self.reports.lock().push(report);
    }
}

impl Recorder {
    fn outcomes(&self) -> Vec<(String, Outcome)> {
        self.reports
            .lock()
            .iter()
            .map(|r| (r.container_id.to_string(), r.outcome.clone()))
            .collect()
    }
}

/// A namespace whose data interface exists once the plugin attached it.
#[derive(Default)]
struct FakeNs {
    attached: Mutex<bool>,
    closed: Mutex<bool>,
}

#[async_trait]
impl NetlinkBackend for FakeNs {
    async fn link_by_name(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        Ok(self.attached.lock().then(|| LinkInfo {
            index: 3,
            name: name.to_string(),
        }))
    }

    async fn addresses(&self, _link: &LinkInfo, family: Family) -> NetworkResult<Vec<IpNet>> {
        Ok(match family {
            Family::V4 => vec!["16.0.0.2/16".parse().unwrap()],
            Family::V6 => Vec::new(),
        })
    }

    async fn routes(&self) -> NetworkResult<Vec<Route>> {
        Ok(vec![
            Route::new("0.0.0.0/0".parse().unwrap()).via(Ipv4Addr::new(172, 17, 0, 1)),
        ])
    }

    async fn replace_route(&self, _route: &Route) -> NetworkResult<()> {
        Ok(())
    }

    async fn delete_route(&self, _route: &Route) -> NetworkResult<()> {
        Ok(())
    }

    async fn traffic_control(&self, _link: &LinkInfo, _commands: &[TcCommand]) -> NetworkResult<()> {
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}

#[derive(Default)]
struct Factory {
    namespaces: Mutex<Vec<(PathBuf, Arc<FakeNs>)>>,
}

impl Factory {
    fn opened(&self) -> Vec<PathBuf> {
        self.namespaces.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    fn ns(&self, netns: &Path) -> Option<Arc<FakeNs>> {
        self.namespaces
            .lock()
            .iter()
            .find(|(p, _)| p == netns)
            .map(|(_, ns)| Arc::clone(ns))
    }
}

#[async_trait]
impl BackendFactory for Factory {
    async fn open(&self, netns: &Path) -> NetworkResult<Arc<dyn NetlinkBackend>> {
        if netns.starts_with("/missing") {
            return Err(NetworkError::backend("no such namespace"));
        }
        if netns.starts_with("/stuck") {
            std::future::pending::<()>().await;
        }
        let ns = Arc::new(FakeNs::default());
        self.namespaces.lock().push((netns.to_path_buf(), Arc::clone(&ns)));
        Ok(ns)
    }
}

/// Attaches every namespace the factory opened for the runtime's netns.
struct Plugin {
    factory: Arc<Factory>,
}

#[async_trait]
impl CniPlugin for Plugin {
    async fn add_network_list(
        &self,
        _list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<CniResult> {
        if let Some(ns) = self.factory.ns(&rt.netns) {
            *ns.attached.lock() = true;
        }
        Ok(CniResult::default())
    }

    async fn del_network_list(
        &self,
        _list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> NetworkResult<()> {
        if let Some(ns) = self.factory.ns(&rt.netns) {
            *ns.attached.lock() = false;
        }
        Ok(())
    }
}

fn setup() -> (Supervisor, Arc<Factory>, Arc<Recorder>) {
    let factory = Arc::new(Factory::default());
    let recorder = Arc::new(Recorder::default());
    let cni = CniInvoker::new(
        Arc::new(Plugin {
            factory: Arc::clone(&factory),
        }),
        PluginSettings::default(),
        RetryPolicy::default(),
    );
    let supervisor = Supervisor::new(
        SidecarConfig::default().configurator_settings(),
        cni,
        factory.clone(),
        recorder.clone(),
    );
    (supervisor, factory, recorder)
}

async fn run(supervisor: &mut Supervisor, input: &str) {
    let paths = MeshbedPaths::new().with_proc_root("/host/proc");
    serve(input.as_bytes(), supervisor, &paths, CancellationToken::new())
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn configure_then_release() {
    let (mut supervisor, factory, recorder) = setup();

    run(
        &mut supervisor,
        r#"{"type":"configure","container_id":"abc123","netns_path":"/run/netns/abc","config":{"network":"default","enable":true,"callback_state":"ready"}}
{"type":"release","container_id":"abc123"}
"#,
    )
    .await;

    let reports = recorder.reports.lock().clone();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].outcome, Outcome::Configured);
    assert_eq!(reports[0].callback_state.as_deref(), Some("ready"));
    assert_eq!(reports[0].active, vec!["default".to_string()]);
    assert_eq!(reports[1].outcome, Outcome::Released);

    let ns = factory.ns(Path::new("/run/netns/abc")).unwrap();
    assert!(*ns.closed.lock());
    assert!(supervisor.containers().is_empty());
}

#[tokio::test]
async fn events_for_one_container_apply_in_order() {
    let (mut supervisor, _factory, recorder) = setup();

    run(
        &mut supervisor,
        r#"{"type":"configure","container_id":"abc123","netns_path":"/run/netns/abc","config":{"network":"default","enable":true}}
{"type":"configure","container_id":"abc123","netns_path":"/run/netns/abc","config":{"network":"default","enable":false}}
"#,
    )
    .await;

    let reports = recorder.reports.lock().clone();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].active, vec!["default".to_string()]);
    assert!(reports[1].active.is_empty());
    assert!(reports[1].is_ok());
    // End of input releases the unit.
    assert_eq!(reports[2].outcome, Outcome::Released);
}

#[tokio::test]
async fn pid_events_resolve_through_proc_root() {
    let (mut supervisor, factory, _recorder) = setup();

    run(
        &mut supervisor,
        r#"{"type":"configure","container_id":"abc123","pid":42,"config":{"network":"default","enable":true}}"#,
    )
    .await;

    assert_eq!(factory.opened(), vec![PathBuf::from("/host/proc/42/ns/net")]);
}

#[tokio::test]
async fn failures_are_reported_and_skipped() {
    let (mut supervisor, _factory, recorder) = setup();

    run(
        &mut supervisor,
        r#"this is not json
{"type":"configure","container_id":"abc123","netns_path":"/run/netns/abc","config":{"network":"other","enable":true}}
{"type":"configure","container_id":"def456","netns_path":"/missing/ns","config":{"network":"default","enable":true}}
"#,
    )
    .await;

    let reports = recorder.reports.lock().clone();
    let mut failed: Vec<_> = reports
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Failed { error } => Some((r.container_id.to_string(), error.clone())),
            _ => None,
        })
        .collect();
    failed.sort();

    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0].0, "abc123");
    assert!(failed[0].1.contains("is not `default`"));
    assert_eq!(failed[1].0, "def456");
    assert!(failed[1].1.contains("failed to open namespace"));
}

#[tokio::test]
async fn new_namespace_replaces_unit() {
    let (mut supervisor, factory, recorder) = setup();

    run(
        &mut supervisor,
        r#"{"type":"configure","container_id":"abc123","netns_path":"/proc/1/ns/net","config":{"network":"default","enable":true}}
{"type":"configure","container_id":"abc123","netns_path":"/proc/2/ns/net","config":{"network":"default","enable":true}}
"#,
    )
    .await;

    assert_eq!(
        factory.opened(),
        vec![PathBuf::from("/proc/1/ns/net"), PathBuf::from("/proc/2/ns/net")]
    );
    let outcomes = recorder.outcomes();
    assert_eq!(
        outcomes,
        vec![
            ("abc123".to_string(), Outcome::Configured),
            ("abc123".to_string(), Outcome::Released),
            ("abc123".to_string(), Outcome::Configured),
            ("abc123".to_string(), Outcome::Released),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn stuck_container_does_not_block_others() {
    let (supervisor, _factory, recorder) = setup();
    let mut supervisor = supervisor.with_queue_depth(1);
    let stuck = ContainerId::new("stuck1").unwrap();
    let fast = ContainerId::new("fast1").unwrap();

    // The first config fills the queue of a unit that never opens its namespace.
    for _ in 0..3 {
        supervisor.configure(
            stuck.clone(),
            PathBuf::from("/stuck/ns"),
            NetworkConfig::enabled("default"),
        );
    }
    supervisor.configure(
        fast.clone(),
        PathBuf::from("/run/netns/fast"),
        NetworkConfig::enabled("default"),
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let outcomes = recorder.outcomes();
            let fast_done = outcomes
                .iter()
                .any(|(id, outcome)| id == "fast1" && *outcome == Outcome::Configured);
            let rejected = outcomes
                .iter()
                .filter(|(id, outcome)| {
                    id == "stuck1"
                        && matches!(outcome, Outcome::Failed { error } if error.contains("queue is full"))
                })
                .count();
            if fast_done && rejected == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fast container was held up by the stuck one");

    assert_eq!(supervisor.containers(), vec![fast, stuck]);
}
