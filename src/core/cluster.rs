/// Cluster: a named node set with its balancer
use crate::balance::{Algorithm, LoadBalancer};
use crate::core::node::{Node, NodeSpec};
use crate::core::transport::{Connector, TcpConnector};
use crate::core::{NodeState, Request, Response};
use crate::error::{LoadBalanceError, PorteroError, PorteroResult};
use crate::event::{EventBus, NodeEvent, NodeEventKind};
use crate::session::SessionSettings;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-cluster routing and connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub algorithm: Algorithm,
    pub session: SessionSettings,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            session: SessionSettings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ClusterSettings {
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

pub struct Cluster {
    name: String,
    settings: ClusterSettings,
    nodes: RwLock<Vec<Arc<Node>>>,
    balancer: LoadBalancer,
    bus: EventBus,
    connector: Arc<dyn Connector>,
}

impl Cluster {
    /// Cluster whose nodes connect over plain TCP
    pub fn new<S: Into<String>>(name: S, settings: ClusterSettings, bus: EventBus) -> Arc<Self> {
        let connector = Arc::new(TcpConnector::new(settings.connect_timeout));
        Self::with_connector(name, settings, bus, connector)
    }

    pub fn with_connector<S: Into<String>>(
        name: S,
        settings: ClusterSettings,
        bus: EventBus,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let name = name.into();
        let balancer = LoadBalancer::new(name.clone(), settings.algorithm, &settings.session);
        Arc::new(Self {
            name,
            settings,
            nodes: RwLock::new(Vec::new()),
            balancer,
            bus,
            connector,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Create a node from `spec`, make it routable and announce it
    pub fn add_node(self: &Arc<Self>, spec: NodeSpec) -> PorteroResult<Arc<Node>> {
        let id = spec.id.clone();
        let node = Node::new(spec, self);

        let added = {
            let mut nodes = self.nodes.write();
            if nodes.iter().any(|existing| existing.id() == id) {
                false
            } else {
                nodes.push(Arc::clone(&node));
                self.balancer.rebuild(&nodes);
                true
            }
        };

        if !added {
            warn!("Node {} already exists in cluster {}", id, self.name);
            self.bus.publish(NodeEvent::failure(
                NodeEventKind::Added,
                node,
                format!("node {} already exists", id),
            ));
            return Err(PorteroError::node_already_exists(id));
        }

        info!("Added node {} ({}) to cluster {}", id, node.addr(), self.name);
        self.bus
            .publish(NodeEvent::success(NodeEventKind::Added, Arc::clone(&node)));
        Ok(node)
    }

    /// Take a node out of rotation, close its connections and announce it
    pub fn remove_node(&self, id: &str) -> PorteroResult<Arc<Node>> {
        let node = {
            let mut nodes = self.nodes.write();
            let index = nodes
                .iter()
                .position(|node| node.id() == id)
                .ok_or_else(|| PorteroError::node_not_found(id))?;
            // Leases stop before the node leaves the snapshot
            nodes[index].mark_removed();
            let node = nodes.remove(index);
            self.balancer.rebuild(&nodes);
            node
        };

        let closed = node.close_connections();
        let forgotten = self.balancer.forget(&node);
        info!(
            "Removed node {} from cluster {} ({} connections closed, {} sessions dropped)",
            id, self.name, closed, forgotten
        );

        self.bus
            .publish(NodeEvent::success(NodeEventKind::Removed, Arc::clone(&node)));
        Ok(node)
    }

    /// Pick a node for `request`
    pub fn next_node(&self, request: &Request) -> Result<Response, LoadBalanceError> {
        self.balancer.response(request)
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|node| node.id() == id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn online_nodes(&self) -> usize {
        self.nodes
            .read()
            .iter()
            .filter(|node| node.state() == NodeState::Online)
            .count()
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("algorithm", &self.settings.algorithm)
            .field("nodes", &self.len())
            .finish()
    }
}
