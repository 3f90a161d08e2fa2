use super::round_robin::RoundRobin;
use super::Pick;
use crate::core::{Node, NodeState, Request, Response};
use crate::session::SessionPersistence;
use std::sync::Arc;

/// Hash-keyed persistence on top of round robin.
///
/// Used for both the source-IP and the 4-tuple strategy; the persistence
/// variant decides how the key is derived from the request.
pub struct HashedPick {
    rr: RoundRobin,
    sessions: SessionPersistence,
}

impl HashedPick {
    pub fn new(sessions: SessionPersistence) -> Self {
        Self {
            rr: RoundRobin::new(),
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionPersistence {
        &self.sessions
    }

    /// Remember the pick unless the node has left its cluster
    fn pin(&self, request: &Request, node: &Arc<Node>) {
        if node.state() == NodeState::Removed {
            return;
        }
        self.sessions.remember(request, Arc::clone(node));
        // Removal may have purged the table between the check and the write
        if node.state() == NodeState::Removed {
            self.sessions.remove(node);
        }
    }
}

impl Pick for HashedPick {
    fn pick(&self, candidates: &[Arc<Node>], request: &Request) -> Option<Response> {
        if let Some(node) = self.sessions.lookup(request) {
            if node.is_routable() {
                return Some(Response::new(node));
            }
        }

        let node = self.rr.next(candidates)?;
        self.pin(request, &node);
        Some(Response::new(node))
    }
}
