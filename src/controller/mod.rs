/// Event-driven reconciliation of per-node services
///
/// The controller listens on the event bus and keeps each node's background
/// services in line with its state: health checks and connection cleaners
/// are (re)started when a node comes up, the cleaner stops and connections
/// are closed when it goes offline, and everything stops on removal.
pub mod cleaner;
pub mod registry;
pub mod tasks;

pub use registry::Registry;
pub use tasks::{ServiceKind, TaskRegistry};

use crate::core::{Cluster, Node, NodeState};
use crate::error::{PorteroError, PorteroResult};
use crate::event::{EventBus, NodeEvent, NodeEventKind, Subscription};
use crate::health::scheduler;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub cleaner_interval: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cleaner_interval: DEFAULT_CLEANER_INTERVAL,
            session_sweep_interval: DEFAULT_SESSION_SWEEP_INTERVAL,
        }
    }
}

pub struct Controller {
    bus: EventBus,
    settings: ControllerSettings,
    registry: Registry,
    tasks: TaskRegistry,
    shutdown: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl Controller {
    /// Create a controller subscribed to `bus`.
    ///
    /// Events published before `start` are queued and handled once the loop
    /// runs.
    pub fn new(bus: EventBus, settings: ControllerSettings) -> Arc<Self> {
        let subscription = bus.subscribe();
        Arc::new(Self {
            bus,
            settings,
            registry: Registry::new(),
            tasks: TaskRegistry::new(),
            shutdown: CancellationToken::new(),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Register a cluster; its session sweeper runs once the controller is started
    pub fn register_cluster(&self, cluster: Arc<Cluster>) -> PorteroResult<()> {
        self.registry.register(Arc::clone(&cluster))?;
        if self.is_started() {
            self.start_session_sweeper(&cluster);
        }

        info!("Registered cluster {} ({})", cluster.name(), cluster.settings().algorithm);
        Ok(())
    }

    fn start_session_sweeper(&self, cluster: &Arc<Cluster>) {
        if cluster.balancer().strategy().sessions().is_none() {
            return;
        }
        let interval = self.settings.session_sweep_interval;
        let sweeping = Arc::clone(cluster);
        self.tasks.start(
            cluster.name(),
            ServiceKind::SessionSweeper,
            &self.shutdown,
            move |token| cleaner::sweep_sessions(sweeping, interval, token),
        );
    }

    /// Unregister a cluster and stop every service belonging to it
    pub fn unregister_cluster(&self, name: &str) -> PorteroResult<Arc<Cluster>> {
        let cluster = self.registry.unregister(name)?;
        self.tasks.cancel(name, ServiceKind::SessionSweeper);
        for node in cluster.nodes() {
            self.tasks.cancel_all_for(node.key());
        }
        info!("Unregistered cluster {}", name);
        Ok(cluster)
    }

    /// Spawn the event loop and the session sweepers of registered clusters.
    ///
    /// Fails if the controller was already started.
    pub fn start(self: &Arc<Self>) -> PorteroResult<JoinHandle<()>> {
        let mut subscription = self
            .subscription
            .lock()
            .take()
            .ok_or_else(|| PorteroError::internal("controller already started"))?;

        for cluster in self.registry.clusters() {
            self.start_session_sweeper(&cluster);
        }

        let controller = Arc::clone(self);
        Ok(tokio::spawn(async move {
            debug!("Controller event loop started");
            loop {
                // Queued events are dropped once shutdown starts
                let event = tokio::select! {
                    biased;
                    _ = controller.shutdown.cancelled() => break,
                    event = subscription.recv() => event,
                };
                match event {
                    Some(event) => controller.handle(&event),
                    None => break,
                }
            }
            debug!("Controller event loop stopped");
        }))
    }

    /// Reconcile one node event
    pub fn handle(&self, event: &NodeEvent) {
        let node = &event.node;
        if !event.success {
            debug!(
                "Ignoring failed {} for {}: {}",
                event.kind,
                node.key(),
                event.cause.as_deref().unwrap_or("unknown cause")
            );
            return;
        }
        // A late state event must not resurrect services of a removed node
        if event.kind != NodeEventKind::Removed && node.state() == NodeState::Removed {
            debug!("Skipping {} for removed node {}", event.kind, node.key());
            return;
        }

        match event.kind {
            NodeEventKind::Added | NodeEventKind::Online | NodeEventKind::Idle => {
                self.start_health_check(node);
                self.start_cleaner(node);
            }
            NodeEventKind::Offline => {
                self.tasks.cancel(node.key(), ServiceKind::ConnectionCleaner);
                let closed = node.close_connections();
                warn!("Node {} offline, closed {} connections", node.key(), closed);
            }
            NodeEventKind::Removed => {
                let cancelled = self.tasks.cancel_all_for(node.key());
                debug!("Node {} removed, stopped {} services", node.key(), cancelled);
            }
        }
    }

    fn start_health_check(&self, node: &Arc<Node>) {
        let Some(check) = node.health_check().cloned() else {
            return;
        };
        let probed = Arc::clone(node);
        self.tasks.start(
            node.key(),
            ServiceKind::HealthCheck,
            &self.shutdown,
            move |token| scheduler::run(probed, check, token),
        );
    }

    fn start_cleaner(&self, node: &Arc<Node>) {
        let interval = self.settings.cleaner_interval;
        let swept = Arc::clone(node);
        self.tasks.start(
            node.key(),
            ServiceKind::ConnectionCleaner,
            &self.shutdown,
            move |token| cleaner::run(swept, interval, token),
        );
    }

    /// Stop the event loop; running services see their tokens cancelled but
    /// stay registered until drained
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop the event loop and every background service
    pub fn shutdown(&self) {
        self.stop();
        let cancelled = self.tasks.cancel_all();
        info!("Controller shut down, stopped {} services", cancelled);
    }

    pub fn is_started(&self) -> bool {
        self.subscription.lock().is_none()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
