use super::round_robin::RoundRobin;
use super::Pick;
use crate::core::{Node, Request, Response};
use std::sync::Arc;

/// HTTP sticky sessions carried in a cookie.
///
/// The cookie holds the hex-encoded stable hash of the chosen node.
/// Candidates must be sorted by that hash so a cookie resolves with a binary
/// search.
pub struct StickyCookie {
    rr: RoundRobin,
    cookie_name: String,
}

impl StickyCookie {
    pub fn new<S: Into<String>>(cookie_name: S) -> Self {
        Self {
            rr: RoundRobin::new(),
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// `Set-Cookie` value pinning a client to `node`
    pub fn set_cookie(&self, node: &Node) -> String {
        format!(
            "{}={}; Path=/; HttpOnly",
            self.cookie_name,
            encode_hash(node.stable_hash())
        )
    }

    fn pinned(&self, candidates: &[Arc<Node>], request: &Request) -> Option<Arc<Node>> {
        let hash = decode_hash(request.cookie(&self.cookie_name)?)?;
        let index = candidates
            .binary_search_by_key(&hash, |node| node.stable_hash())
            .ok()?;
        let node = &candidates[index];
        node.is_routable().then(|| Arc::clone(node))
    }
}

impl Pick for StickyCookie {
    fn pick(&self, candidates: &[Arc<Node>], request: &Request) -> Option<Response> {
        if let Some(node) = self.pinned(candidates, request) {
            return Some(Response::new(node));
        }

        let node = self.rr.next(candidates)?;
        let cookie = self.set_cookie(&node);
        Some(Response::with_cookie(node, cookie))
    }
}

pub fn encode_hash(hash: u64) -> String {
    hex::encode(hash.to_be_bytes())
}

pub fn decode_hash(value: &str) -> Option<u64> {
    let bytes: [u8; 8] = hex::decode(value).ok()?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::{cluster_of, request};
    use crate::core::Health;

    fn sorted(nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        let mut nodes = nodes.to_vec();
        nodes.sort_by_key(|node| node.stable_hash());
        nodes
    }

    fn cookie_value(set_cookie: &str) -> &str {
        set_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, value)| value)
            .unwrap()
    }

    #[test]
    fn test_hash_hex_round_trip() {
        assert_eq!(encode_hash(0x00ff_0000_0000_0001), "00ff000000000001");
        assert_eq!(decode_hash("00ff000000000001"), Some(0x00ff_0000_0000_0001));
        assert_eq!(decode_hash("zz"), None);
        assert_eq!(decode_hash("00ff"), None);
    }

    #[test]
    fn test_first_request_sets_cookie() {
        let (_cluster, nodes) = cluster_of(3);
        let nodes = sorted(&nodes);
        let sticky = StickyCookie::new("PORTERO_NODE");

        let response = sticky.pick(&nodes, &request("10.0.0.1:1000")).unwrap();
        let set_cookie = response.set_cookie.unwrap();
        assert!(set_cookie.starts_with("PORTERO_NODE="));
        assert!(set_cookie.ends_with("; Path=/; HttpOnly"));
        assert_eq!(
            decode_hash(cookie_value(&set_cookie)),
            Some(response.node.stable_hash())
        );
    }

    #[test]
    fn test_cookie_pins_node() {
        let (_cluster, nodes) = cluster_of(3);
        let nodes = sorted(&nodes);
        let sticky = StickyCookie::new("PORTERO_NODE");

        let target = &nodes[2];
        let header = format!("a=b; PORTERO_NODE={}", encode_hash(target.stable_hash()));
        for _ in 0..5 {
            let response = sticky
                .pick(&nodes, &request("10.0.0.1:1000").with_header("Cookie", header.as_str()))
                .unwrap();
            assert_eq!(response.node.id(), target.id());
            assert!(response.set_cookie.is_none());
        }
    }

    #[test]
    fn test_unroutable_pin_is_rerouted() {
        let (_cluster, nodes) = cluster_of(2);
        let nodes = sorted(&nodes);
        let sticky = StickyCookie::new("PORTERO_NODE");
        nodes[0].apply_health(Health::Bad);

        let header = format!("PORTERO_NODE={}", encode_hash(nodes[0].stable_hash()));
        let response = sticky
            .pick(&nodes, &request("10.0.0.1:1000").with_header("Cookie", header))
            .unwrap();
        assert_eq!(response.node.id(), nodes[1].id());
        assert!(response.set_cookie.is_some());
    }
}
