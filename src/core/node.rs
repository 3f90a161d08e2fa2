/// Backend node: health-driven state machine plus its connection pool
use crate::core::cluster::Cluster;
use crate::core::connection::Connection;
use crate::core::transport::Connector;
use crate::core::{Health, NodeState};
use crate::error::ConnectionError;
use crate::event::{EventBus, NodeEvent, NodeEventKind};
use crate::health::window::SampleWindow;
use crate::health::HealthCheck;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Description of a node to add to a cluster
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub addr: SocketAddr,
    /// `None` means unbounded
    pub max_connections: Option<usize>,
    pub health_check: Option<HealthCheck>,
}

impl NodeSpec {
    pub fn new<S: Into<String>>(id: S, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
            max_connections: None,
            health_check: None,
        }
    }

    /// Cap concurrent connections; a negative limit means unbounded
    pub fn with_max_connections(mut self, limit: i64) -> Self {
        self.max_connections = usize::try_from(limit).ok();
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

struct Status {
    health: Health,
    state: NodeState,
}

pub struct Node {
    id: String,
    key: String,
    addr: SocketAddr,
    max_connections: Option<usize>,
    health_check: Option<HealthCheck>,
    stable_hash: u64,
    status: Mutex<Status>,
    samples: Mutex<SampleWindow>,
    active_connections: AtomicUsize,
    available: DashMap<u64, Arc<Connection>>,
    leased: DashMap<u64, Arc<Connection>>,
    next_connection_id: AtomicU64,
    cluster: Weak<Cluster>,
    bus: EventBus,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Node {
    /// Nodes are only created by their cluster
    pub(crate) fn new(spec: NodeSpec, cluster: &Arc<Cluster>) -> Arc<Self> {
        let samples = match &spec.health_check {
            Some(check) => SampleWindow::new(check.samples, check.rise, check.fall),
            None => SampleWindow::default(),
        };
        let settings = cluster.settings();

        Arc::new(Self {
            key: format!("{}/{}", cluster.name(), spec.id),
            stable_hash: stable_hash(&spec.id),
            id: spec.id,
            addr: spec.addr,
            max_connections: spec.max_connections,
            health_check: spec.health_check,
            status: Mutex::new(Status {
                health: Health::Unknown,
                state: NodeState::Added,
            }),
            samples: Mutex::new(samples),
            active_connections: AtomicUsize::new(0),
            available: DashMap::new(),
            leased: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            cluster: Arc::downgrade(cluster),
            bus: cluster.events().clone(),
            connector: cluster.connector(),
            connect_timeout: settings.connect_timeout,
            idle_timeout: settings.idle_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier unique across clusters: `<cluster>/<node>`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub fn health_check(&self) -> Option<&HealthCheck> {
        self.health_check.as_ref()
    }

    /// Hash of the node id that stays the same across restarts
    pub fn stable_hash(&self) -> u64 {
        self.stable_hash
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.upgrade()
    }

    pub fn health(&self) -> Health {
        self.status.lock().health
    }

    pub fn state(&self) -> NodeState {
        self.status.lock().state
    }

    pub fn is_routable(&self) -> bool {
        self.state().is_routable()
    }

    /// Connections owned by this node, leased or idle
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn available_connections(&self) -> usize {
        self.available.len()
    }

    pub fn leased_connections(&self) -> usize {
        self.leased.len()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Feed one probe outcome into the rolling window and return the verdict
    pub fn record_sample(&self, passed: bool) -> Health {
        self.samples.lock().record(passed)
    }

    /// Apply a health verdict and move the state machine.
    ///
    /// Returns the new state and publishes the matching event when the state
    /// actually changed.
    pub fn apply_health(self: &Arc<Self>, health: Health) -> Option<NodeState> {
        let (previous, next, kind) = {
            let mut status = self.status.lock();
            if status.state == NodeState::Removed {
                return None;
            }

            let previous_health = std::mem::replace(&mut status.health, health);
            let (next, kind) = match health {
                Health::Good if previous_health != Health::Good => {
                    (NodeState::Online, NodeEventKind::Online)
                }
                Health::Medium if previous_health != Health::Medium => {
                    (NodeState::Idle, NodeEventKind::Idle)
                }
                Health::Bad if previous_health != Health::Bad => {
                    (NodeState::Offline, NodeEventKind::Offline)
                }
                _ => return None,
            };
            if status.state == next {
                return None;
            }
            (std::mem::replace(&mut status.state, next), next, kind)
        };

        if next == NodeState::Offline {
            warn!("Node {} is {} -> {} (health {})", self.key, previous, next, health);
        } else {
            info!("Node {} is {} -> {} (health {})", self.key, previous, next, health);
        }
        self.bus.publish(NodeEvent::success(kind, Arc::clone(self)));
        Some(next)
    }

    /// Enter the terminal state; returns `false` if already removed
    pub(crate) fn mark_removed(&self) -> bool {
        let mut status = self.status.lock();
        if status.state == NodeState::Removed {
            return false;
        }
        status.state = NodeState::Removed;
        true
    }

    /// Lease a pooled connection, or open a new one within the node's limit.
    ///
    /// A new connection is returned immediately while its transport is still
    /// being established; writes issued meanwhile are queued on it.
    pub fn connection(self: &Arc<Self>) -> Result<Arc<Connection>, ConnectionError> {
        if !self.is_routable() {
            return Err(ConnectionError::NodeUnavailable {
                node: self.key.clone(),
            });
        }

        while let Some(connection) = self.take_available() {
            if connection.is_accepting() {
                let leased = connection.lease()?;
                self.leased.insert(connection.id(), connection);
                return Ok(leased);
            }
            self.discard(&connection);
        }

        let runtime = Handle::try_current()
            .map_err(|e| ConnectionError::from(io::Error::new(io::ErrorKind::Other, e)))?;
        self.reserve_slot()?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, Arc::downgrade(self));
        let leased = connection.lease()?;
        self.leased.insert(id, Arc::clone(&connection));

        let connector = Arc::clone(&self.connector);
        let connect_timeout = self.connect_timeout;
        let addr = self.addr;
        let key = self.key.clone();
        runtime.spawn(async move {
            let connected = match timeout(connect_timeout, connector.connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )),
            };
            match connected {
                Ok(transport) => {
                    if !connection.on_ready(transport) {
                        debug!("Connection {} on {} closed before it was ready", id, key);
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to node {} at {}: {}", key, addr, e);
                    connection.on_failure(e);
                }
            }
        });

        debug!("Opened connection {} on {}", id, self.key);
        Ok(leased)
    }

    /// Called by `Connection::release`
    pub(crate) fn return_connection(&self, connection: &Arc<Connection>) {
        // Already reclaimed by the cleaner or a node-wide close
        if self.leased.remove(&connection.id()).is_none() {
            return;
        }

        if self.is_routable() && connection.is_accepting() {
            self.available
                .insert(connection.id(), Arc::clone(connection));
        } else {
            self.discard(connection);
        }
    }

    /// Close every connection of this node; returns how many were closed
    pub fn close_connections(&self) -> usize {
        let closed = self.reclaim(&self.available, |_| true) + self.reclaim(&self.leased, |_| true);
        if closed > 0 {
            info!("Closed {} connections on node {}", closed, self.key);
        }
        closed
    }

    /// Remove connections whose timeout elapsed and whose transport is not active
    pub fn sweep_connections(&self) -> usize {
        let now = Instant::now();
        let expired =
            |connection: &Connection| connection.is_expired(now, self.connect_timeout, self.idle_timeout);
        self.reclaim(&self.available, expired) + self.reclaim(&self.leased, expired)
    }

    fn reclaim<F>(&self, pool: &DashMap<u64, Arc<Connection>>, select: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        // Collect first: removing while iterating a DashMap shard deadlocks.
        let ids: Vec<u64> = pool
            .iter()
            .filter(|entry| select(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in ids {
            if let Some((_, connection)) = pool.remove(&id) {
                self.discard(&connection);
                removed += 1;
            }
        }
        removed
    }

    fn take_available(&self) -> Option<Arc<Connection>> {
        loop {
            let id = self.available.iter().next().map(|entry| *entry.key())?;
            if let Some((_, connection)) = self.available.remove(&id) {
                return Some(connection);
            }
        }
    }

    fn discard(&self, connection: &Connection) {
        connection.close();
        self.release_slot();
    }

    fn reserve_slot(&self) -> Result<(), ConnectionError> {
        match self.max_connections {
            None => {
                self.active_connections.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(max) => self
                .active_connections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    (count < max).then_some(count + 1)
                })
                .map(|_| ())
                .map_err(|_| ConnectionError::TooManyConnections {
                    node: self.key.clone(),
                    max,
                }),
        }
    }

    fn release_slot(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }
}

fn stable_hash(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.lock();
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("addr", &self.addr)
            .field("health", &status.health)
            .field("state", &status.state)
            .field("active_connections", &self.active_connections())
            .finish_non_exhaustive()
    }
}
