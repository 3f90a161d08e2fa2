use super::Pick;
use crate::core::{Node, Request, Response};
use rand::seq::IteratorRandom;
use std::sync::Arc;

/// Uniform pick among routable candidates
#[derive(Debug, Default)]
pub struct RandomPick;

impl Pick for RandomPick {
    fn pick(&self, candidates: &[Arc<Node>], _request: &Request) -> Option<Response> {
        candidates
            .iter()
            .filter(|node| node.is_routable())
            .choose(&mut rand::thread_rng())
            .map(|node| Response::new(Arc::clone(node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::{cluster_of, request};
    use crate::core::Health;
    use std::collections::HashSet;

    #[test]
    fn test_random_only_routable() {
        let (_cluster, nodes) = cluster_of(4);
        nodes[0].apply_health(Health::Bad);
        nodes[2].apply_health(Health::Bad);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let response = RandomPick.pick(&nodes, &request("10.0.0.1:1000")).unwrap();
            seen.insert(response.node.id().to_string());
        }
        assert_eq!(seen, HashSet::from(["n1".to_string(), "n3".to_string()]));
    }

    #[test]
    fn test_random_empty() {
        assert!(RandomPick.pick(&[], &request("10.0.0.1:1000")).is_none());
    }
}
