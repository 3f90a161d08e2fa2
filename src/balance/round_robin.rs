use super::Pick;
use crate::core::{Node, Request, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin selection over the candidate snapshot
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next routable node in cyclic order.
    ///
    /// Each call advances the cursor once per inspected node, so at most one
    /// full lap is made before giving up.
    pub fn next(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
        if candidates.is_empty() {
            return None;
        }

        for _ in 0..candidates.len() {
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
            let node = &candidates[index];
            if node.is_routable() {
                return Some(Arc::clone(node));
            }
        }
        None
    }
}

impl Pick for RoundRobin {
    fn pick(&self, candidates: &[Arc<Node>], _request: &Request) -> Option<Response> {
        self.next(candidates).map(Response::new)
    }
}
