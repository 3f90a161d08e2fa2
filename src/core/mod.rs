/// Core routing model: clusters, nodes, pooled connections and the transport seam
pub mod cluster;
pub mod connection;
pub mod node;
pub mod transport;

pub use cluster::{Cluster, ClusterSettings};
pub use connection::Connection;
pub use node::{Node, NodeSpec};
pub use transport::{Completion, Connector, TcpConnector, Transport, WriteHandle};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Probe-derived status of a node.
///
/// Declaration order gives `Good > Medium > Bad > Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Bad,
    Medium,
    Good,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Good => write!(f, "GOOD"),
            Health::Medium => write!(f, "MEDIUM"),
            Health::Bad => write!(f, "BAD"),
            Health::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Lifecycle stage of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Added,
    Online,
    Idle,
    Offline,
    Removed,
}

impl NodeState {
    /// Whether requests may be routed to (and connections leased from) a node in this state
    pub fn is_routable(&self) -> bool {
        matches!(self, NodeState::Added | NodeState::Online | NodeState::Idle)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Added => write!(f, "ADDED"),
            NodeState::Online => write!(f, "ONLINE"),
            NodeState::Idle => write!(f, "IDLE"),
            NodeState::Offline => write!(f, "OFFLINE"),
            NodeState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Already-parsed metadata of an inbound connection or request
#[derive(Debug, Clone)]
pub struct Request {
    pub client: SocketAddr,
    /// HTTP headers keyed by lowercase name; `None` for plain L4 traffic
    pub headers: Option<HashMap<String, String>>,
}

impl Request {
    pub fn new(client: SocketAddr) -> Self {
        Self {
            client,
            headers: None,
        }
    }

    pub fn with_header<N: AsRef<str>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()?
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Look up a cookie value in the `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }
}

/// Routing decision handed back to the transport layer
#[derive(Debug, Clone)]
pub struct Response {
    pub node: Arc<Node>,
    /// `Set-Cookie` value to attach when a sticky session was created
    pub set_cookie: Option<String>,
}

impl Response {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            set_cookie: None,
        }
    }

    pub fn with_cookie(node: Arc<Node>, cookie: String) -> Self {
        Self {
            node,
            set_cookie: Some(cookie),
        }
    }
}
