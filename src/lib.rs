pub mod balance;
pub mod config;
pub mod controller;
/// Portero - backend routing and connection-lifecycle engine for L4/L7 load balancers
///
/// Portero picks a backend node for each inbound connection or request, hands
/// out pooled backend connections that buffer writes while they connect, and
/// tracks node health so routing stays correct while backends come and go.
///
/// Socket plumbing stays with the caller: the proxy layer asks a cluster for
/// a node, leases a connection from it and moves bytes through it.
pub mod core;
pub mod error;
pub mod event;
pub mod health;
pub mod session;
pub mod utils;

pub use crate::balance::Algorithm;
pub use crate::config::Config;
pub use crate::controller::{Controller, ControllerSettings};
pub use crate::core::{
    Cluster, ClusterSettings, Connection, Health, Node, NodeSpec, NodeState, Request, Response,
};
pub use crate::error::{PorteroError, PorteroResult};
pub use crate::event::{EventBus, NodeEvent, NodeEventKind};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Every configured cluster wired to one event bus and controller
pub struct Portero {
    bus: EventBus,
    controller: Arc<Controller>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Portero {
    /// Build clusters and nodes from a validated configuration.
    ///
    /// Nothing runs yet: node announcements are queued for the controller
    /// until `start` is called.
    pub fn from_config(config: &Config) -> PorteroResult<Self> {
        config.validate()?;

        let bus = EventBus::new();
        let controller = Controller::new(bus.clone(), config.controller.settings());

        for cluster_config in &config.clusters {
            let cluster = Cluster::new(cluster_config.name.clone(), cluster_config.settings(), bus.clone());
            controller.register_cluster(Arc::clone(&cluster))?;

            for node_config in &cluster_config.nodes {
                cluster.add_node(node_config.to_spec()?)?;
            }
        }

        Ok(Self {
            bus,
            controller,
            event_loop: Mutex::new(None),
        })
    }

    /// Start the controller and with it every background service
    pub fn start(&self) -> PorteroResult<()> {
        let handle = self.controller.start()?;
        *self.event_loop.lock() = Some(handle);
        info!(
            "Portero started with {} clusters: {}",
            self.controller.registry().len(),
            self.controller.registry().names().join(", ")
        );
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.controller.registry().get(name)
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.controller.registry().clusters()
    }

    /// Pick a node of cluster `name` for `request`
    pub fn route(&self, name: &str, request: &Request) -> PorteroResult<Response> {
        let cluster = self
            .cluster(name)
            .ok_or_else(|| PorteroError::cluster_not_found(name))?;
        Ok(cluster.next_node(request)?)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Stop every background task and wait for them to exit
    pub async fn shutdown(&self) {
        // The loop must be gone before draining, or it could start new services
        self.controller.stop();
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Controller event loop ended abnormally: {}", e);
            }
        }

        let stopped = self.controller.tasks().drain().await;
        info!("Stopped {} background services", stopped);
    }
}
