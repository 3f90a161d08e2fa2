/// Session persistence: remembers which node a client was routed to
pub mod ttl;

pub use ttl::TtlMap;

use crate::core::{Node, Request};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 1_000_000;
pub const DEFAULT_COOKIE_NAME: &str = "PORTERO_NODE";

/// Session persistence settings shared by the hashing and sticky strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub ttl: Duration,
    pub max_entries: usize,
    pub cookie_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

/// Client subnet used as the source-IP routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubnetKey {
    /// IPv4 address masked to /24
    V4(u32),
    /// IPv6 address masked to /48
    V6(u128),
}

impl SubnetKey {
    const V4_MASK: u32 = 0xFFFF_FF00;
    const V6_MASK: u128 = !0u128 << 80;

    pub fn from_ip(ip: IpAddr) -> Self {
        // IPv4-mapped IPv6 clients share the key of their IPv4 subnet
        match ip.to_canonical() {
            IpAddr::V4(v4) => SubnetKey::V4(u32::from(v4) & Self::V4_MASK),
            IpAddr::V6(v6) => SubnetKey::V6(u128::from(v6) & Self::V6_MASK),
        }
    }
}

/// Routing-key to node mapping, keyed the way the strategy needs
pub enum SessionPersistence {
    None,
    SourceIp(TtlMap<SubnetKey, Arc<Node>>),
    FourTuple(TtlMap<SocketAddr, Arc<Node>>),
}

impl SessionPersistence {
    pub fn source_ip(settings: &SessionSettings) -> Self {
        SessionPersistence::SourceIp(TtlMap::new(settings.ttl, settings.max_entries))
    }

    pub fn four_tuple(settings: &SessionSettings) -> Self {
        SessionPersistence::FourTuple(TtlMap::new(settings.ttl, settings.max_entries))
    }

    pub fn lookup(&self, request: &Request) -> Option<Arc<Node>> {
        match self {
            SessionPersistence::None => None,
            SessionPersistence::SourceIp(map) => map.get(&SubnetKey::from_ip(request.client.ip())),
            SessionPersistence::FourTuple(map) => map.get(&request.client),
        }
    }

    /// Pin the request's routing key to `node`; a full table evicts its
    /// least recently written entry
    pub fn remember(&self, request: &Request, node: Arc<Node>) {
        let previous = match self {
            SessionPersistence::None => return,
            SessionPersistence::SourceIp(map) => {
                map.insert(SubnetKey::from_ip(request.client.ip()), node)
            }
            SessionPersistence::FourTuple(map) => map.insert(request.client, node),
        };
        if previous.is_none() {
            trace!("Pinned new session for client {}", request.client);
        }
    }

    /// Forget every entry pointing at `node`
    pub fn remove(&self, node: &Node) -> usize {
        let points_elsewhere = |mapped: &Arc<Node>| !std::ptr::eq(Arc::as_ptr(mapped), node);
        match self {
            SessionPersistence::None => 0,
            SessionPersistence::SourceIp(map) => map.retain_values(points_elsewhere),
            SessionPersistence::FourTuple(map) => map.retain_values(points_elsewhere),
        }
    }

    /// Drop expired entries
    pub fn sweep(&self) -> usize {
        match self {
            SessionPersistence::None => 0,
            SessionPersistence::SourceIp(map) => map.sweep(),
            SessionPersistence::FourTuple(map) => map.sweep(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SessionPersistence::None => 0,
            SessionPersistence::SourceIp(map) => map.len(),
            SessionPersistence::FourTuple(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Cluster, ClusterSettings, NodeSpec};
    use crate::event::EventBus;

    #[test]
    fn test_ipv4_subnet_key() {
        let a = SubnetKey::from_ip("192.168.1.1".parse().unwrap());
        let b = SubnetKey::from_ip("192.168.1.251".parse().unwrap());
        let c = SubnetKey::from_ip("192.168.2.1".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SubnetKey::V4(0xC0A8_0100));
    }

    #[test]
    fn test_ipv6_subnet_key() {
        let a = SubnetKey::from_ip("2001:db8:1::1".parse().unwrap());
        let b = SubnetKey::from_ip("2001:db8:1:ffff::2".parse().unwrap());
        let c = SubnetKey::from_ip("2001:db8:2::1".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mapped_ipv4_shares_subnet() {
        let mapped = SubnetKey::from_ip("::ffff:10.18.1.10".parse().unwrap());
        let plain = SubnetKey::from_ip("10.18.1.213".parse().unwrap());
        assert_eq!(mapped, plain);
    }

    #[test]
    fn test_remove_forgets_node() {
        let cluster = Cluster::new("s", ClusterSettings::default(), EventBus::new());
        let a = cluster
            .add_node(NodeSpec::new("a", "127.0.0.1:1".parse().unwrap()))
            .unwrap();
        let b = cluster
            .add_node(NodeSpec::new("b", "127.0.0.1:2".parse().unwrap()))
            .unwrap();

        let sessions = SessionPersistence::four_tuple(&SessionSettings::default());
        for port in 1000..1004u16 {
            let node = if port % 2 == 0 { &a } else { &b };
            let request = Request::new(SocketAddr::from(([10, 0, 0, 1], port)));
            sessions.remember(&request, Arc::clone(node));
        }

        assert_eq!(sessions.remove(&a), 2);
        assert_eq!(sessions.len(), 2);
        let request = Request::new(SocketAddr::from(([10, 0, 0, 1], 1001)));
        assert_eq!(sessions.lookup(&request).unwrap().id(), "b");
    }

    #[test]
    fn test_full_table_still_pins_new_subnets() {
        let cluster = Cluster::new("s", ClusterSettings::default(), EventBus::new());
        let a = cluster
            .add_node(NodeSpec::new("a", "127.0.0.1:1".parse().unwrap()))
            .unwrap();
        let b = cluster
            .add_node(NodeSpec::new("b", "127.0.0.1:2".parse().unwrap()))
            .unwrap();

        let settings = SessionSettings {
            max_entries: 2,
            ..SessionSettings::default()
        };
        let sessions = SessionPersistence::source_ip(&settings);
        let client = |ip: &str| Request::new(SocketAddr::new(ip.parse().unwrap(), 4000));

        sessions.remember(&client("10.0.1.1"), Arc::clone(&a));
        sessions.remember(&client("10.0.2.1"), Arc::clone(&a));
        sessions.remember(&client("192.168.9.1"), Arc::clone(&b));

        assert_eq!(sessions.len(), 2);
        assert!(sessions.lookup(&client("10.0.1.1")).is_none());
        assert_eq!(sessions.lookup(&client("192.168.9.2")).unwrap().id(), "b");
        assert_eq!(sessions.lookup(&client("10.0.2.7")).unwrap().id(), "a");
    }
}
