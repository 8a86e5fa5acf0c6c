//! One management unit per container.
//!
//! Each unit is a task that owns the container's [`NetworkConfigurator`] and
//! drains a bounded queue, so events for one container are applied strictly
//! in arrival order while different containers proceed independently.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use meshbed_common::{ContainerId, NetworkConfig};
use meshbed_network::{
    CniInvoker, ConfiguratorSettings, NetlinkBackend, NetnsHandle, NetworkConfigurator,
    NetworkResult,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::status::{Outcome, StatusReport, StatusSink};

/// Opens the kernel backend of a namespace.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Open a backend bound to the namespace at `netns`.
    async fn open(&self, netns: &Path) -> NetworkResult<Arc<dyn NetlinkBackend>>;
}

/// Opens [`NetnsHandle`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetnsFactory;

#[async_trait]
impl BackendFactory for NetnsFactory {
    async fn open(&self, netns: &Path) -> NetworkResult<Arc<dyn NetlinkBackend>> {
        Ok(Arc::new(NetnsHandle::open(netns).await?))
    }
}

struct UnitHandle {
    netns: PathBuf,
    tx: mpsc::Sender<NetworkConfig>,
    task: JoinHandle<()>,
}

/// Shared pieces every unit is built from.
#[derive(Clone)]
struct UnitContext {
    settings: ConfiguratorSettings,
    cni: CniInvoker,
    backends: Arc<dyn BackendFactory>,
    sink: Arc<dyn StatusSink>,
    cancel: CancellationToken,
}

/// Routes events to per-container units.
///
/// Intake never waits on a unit: a full queue is reported as a failure for
/// that container, and releases drain in the background.
pub struct Supervisor {
    ctx: UnitContext,
    queue_depth: usize,
    units: HashMap<ContainerId, UnitHandle>,
    releasing: HashMap<ContainerId, JoinHandle<()>>,
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        settings: ConfiguratorSettings,
        cni: CniInvoker,
        backends: Arc<dyn BackendFactory>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            ctx: UnitContext {
                settings,
                cni,
                backends,
                sink,
                cancel: CancellationToken::new(),
            },
            queue_depth: 16,
            units: HashMap::new(),
            releasing: HashMap::new(),
        }
    }

    /// Set the per-container queue length.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Token that aborts in-flight operations of every unit.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Containers with a running unit.
    #[must_use]
    pub fn containers(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.units.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Queue a config for a container, starting its unit if needed.
    ///
    /// A config for a different namespace than the unit was started with
    /// replaces the unit. The new unit starts once the old one has drained.
    pub fn configure(
        &mut self,
        container_id: ContainerId,
        netns: PathBuf,
        config: NetworkConfig,
    ) {
        self.releasing.retain(|_, task| !task.is_finished());

        if self
            .units
            .get(&container_id)
            .is_some_and(|unit| unit.netns != netns || unit.task.is_finished())
        {
            tracing::info!(container = %container_id.short(), netns = %netns.display(), "Replacing unit");
            self.release(&container_id);
        }

        let unit = match self.units.entry(container_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let after = self.releasing.remove(&container_id);
                entry.insert(spawn_unit(
                    self.ctx.clone(),
                    container_id.clone(),
                    netns,
                    self.queue_depth,
                    after,
                ))
            }
        };

        let (config, error) = match unit.tx.try_send(config) {
            Ok(()) => return,
            Err(TrySendError::Full(config)) => {
                tracing::warn!(container = %container_id.short(), depth = self.queue_depth, "Event queue full, dropping config");
                (config, format!("event queue is full ({} pending)", self.queue_depth))
            }
            Err(TrySendError::Closed(config)) => {
                tracing::warn!(netns = %unit.netns.display(), "Unit stopped before receiving config");
                (config, "unit stopped before receiving config".to_string())
            }
        };

        let mut report = StatusReport::new(container_id, Outcome::Failed { error });
        report.network = Some(config.network);
        report.callback_state = config.callback_state;
        let sink = Arc::clone(&self.ctx.sink);
        tokio::spawn(async move { sink.report(report).await });
    }

    /// Stop a container's unit once it has drained its queue.
    ///
    /// Returns immediately; the `Released` report follows the unit's last
    /// report.
    pub fn release(&mut self, container_id: &ContainerId) {
        let Some(unit) = self.units.remove(container_id) else {
            tracing::debug!(container = %container_id.short(), "Release for unknown container");
            return;
        };
        drop(unit.tx);

        let sink = Arc::clone(&self.ctx.sink);
        let id = container_id.clone();
        let drain = tokio::spawn(async move {
            if let Err(e) = unit.task.await {
                tracing::error!(container = %id.short(), error = %e, "Unit task failed");
            }
            sink.report(StatusReport::new(id, Outcome::Released)).await;
        });
        self.releasing.insert(container_id.clone(), drain);
    }

    /// Release every unit and wait until all of them have drained.
    pub async fn shutdown(&mut self) {
        for id in self.containers() {
            self.release(&id);
        }
        for (id, drain) in self.releasing.drain() {
            if let Err(e) = drain.await {
                tracing::error!(container = %id.short(), error = %e, "Release task failed");
            }
        }
    }
}

fn spawn_unit(
    ctx: UnitContext,
    container_id: ContainerId,
    netns: PathBuf,
    depth: usize,
    after: Option<JoinHandle<()>>,
) -> UnitHandle {
    let (tx, rx) = mpsc::channel(depth);
    tracing::debug!(container = %container_id.short(), netns = %netns.display(), "Starting unit");
    let task = tokio::spawn(run_unit(ctx, container_id, netns.clone(), rx, after));
    UnitHandle { netns, tx, task }
}

async fn run_unit(
    ctx: UnitContext,
    container_id: ContainerId,
    netns: PathBuf,
    mut rx: mpsc::Receiver<NetworkConfig>,
    after: Option<JoinHandle<()>>,
) {
    // The previous unit of this container must be gone first.
    if let Some(previous) = after {
        if let Err(e) = previous.await {
            tracing::error!(container = %container_id.short(), error = %e, "Previous unit failed");
        }
    }

    let backend = match ctx.backends.open(&netns).await {
        Ok(backend) => backend,
        Err(e) => {
            let error = format!("failed to open namespace {}: {e}", netns.display());
            while let Some(config) = rx.recv().await {
                let mut report = StatusReport::new(
                    container_id.clone(),
                    Outcome::Failed {
                        error: error.clone(),
                    },
                );
                report.network = Some(config.network);
                ctx.sink.report(report).await;
            }
            return;
        }
    };

    let mut configurator = NetworkConfigurator::new(
        container_id.clone(),
        &netns,
        ctx.settings.clone(),
        ctx.cni.clone(),
        backend,
    );

    while let Some(config) = rx.recv().await {
        let result = configurator.configure_network(&ctx.cancel, &config).await;

        let outcome = match result {
            Ok(()) => Outcome::Configured,
            Err(e) => Outcome::Failed {
                error: e.to_string(),
            },
        };
        let mut report = StatusReport::new(container_id.clone(), outcome);
        report.network = Some(config.network);
        report.callback_state = config.callback_state;
        report.active = configurator.list_active();
        report.warnings = configurator
            .take_warnings()
            .iter()
            .map(ToString::to_string)
            .collect();
        ctx.sink.report(report).await;
    }

    configurator.close();
}
