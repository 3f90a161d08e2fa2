/// Load-balancing strategies and the per-cluster balancer
///
/// The balancer holds an immutable candidate snapshot that is swapped
/// wholesale whenever cluster membership changes, so picks never take a lock
/// on the node list.
pub mod hash;
pub mod random;
pub mod round_robin;
pub mod sticky;

pub use hash::HashedPick;
pub use random::RandomPick;
pub use round_robin::RoundRobin;
pub use sticky::StickyCookie;

use crate::core::{Node, Request, Response};
use crate::error::LoadBalanceError;
use crate::session::{SessionPersistence, SessionSettings};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Node selection contract shared by every strategy
pub trait Pick: Send + Sync {
    /// Select a routable node from `candidates`, or `None` if there is none
    fn pick(&self, candidates: &[Arc<Node>], request: &Request) -> Option<Response>;
}

/// Configured balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Random,
    SourceIpHash,
    FourTupleHash,
    StickySession,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::RoundRobin => write!(f, "round_robin"),
            Algorithm::Random => write!(f, "random"),
            Algorithm::SourceIpHash => write!(f, "source_ip_hash"),
            Algorithm::FourTupleHash => write!(f, "four_tuple_hash"),
            Algorithm::StickySession => write!(f, "sticky_session"),
        }
    }
}

/// Strategy instance, fixed when the cluster is built
pub enum LoadBalance {
    RoundRobin(RoundRobin),
    Random(RandomPick),
    SourceIpHash(HashedPick),
    FourTupleHash(HashedPick),
    StickySession(StickyCookie),
}

impl LoadBalance {
    pub fn new(algorithm: Algorithm, session: &SessionSettings) -> Self {
        match algorithm {
            Algorithm::RoundRobin => LoadBalance::RoundRobin(RoundRobin::new()),
            Algorithm::Random => LoadBalance::Random(RandomPick),
            Algorithm::SourceIpHash => {
                LoadBalance::SourceIpHash(HashedPick::new(SessionPersistence::source_ip(session)))
            }
            Algorithm::FourTupleHash => {
                LoadBalance::FourTupleHash(HashedPick::new(SessionPersistence::four_tuple(session)))
            }
            Algorithm::StickySession => {
                LoadBalance::StickySession(StickyCookie::new(session.cookie_name.clone()))
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LoadBalance::RoundRobin(_) => Algorithm::RoundRobin,
            LoadBalance::Random(_) => Algorithm::Random,
            LoadBalance::SourceIpHash(_) => Algorithm::SourceIpHash,
            LoadBalance::FourTupleHash(_) => Algorithm::FourTupleHash,
            LoadBalance::StickySession(_) => Algorithm::StickySession,
        }
    }

    fn as_pick(&self) -> &dyn Pick {
        match self {
            LoadBalance::RoundRobin(strategy) => strategy,
            LoadBalance::Random(strategy) => strategy,
            LoadBalance::SourceIpHash(strategy) | LoadBalance::FourTupleHash(strategy) => strategy,
            LoadBalance::StickySession(strategy) => strategy,
        }
    }

    /// Session table, for strategies that keep one
    pub fn sessions(&self) -> Option<&SessionPersistence> {
        match self {
            LoadBalance::SourceIpHash(strategy) | LoadBalance::FourTupleHash(strategy) => {
                Some(strategy.sessions())
            }
            _ => None,
        }
    }
}

pub struct LoadBalancer {
    cluster: String,
    candidates: ArcSwap<Vec<Arc<Node>>>,
    strategy: LoadBalance,
}

impl LoadBalancer {
    pub fn new<S: Into<String>>(cluster: S, algorithm: Algorithm, session: &SessionSettings) -> Self {
        Self {
            cluster: cluster.into(),
            candidates: ArcSwap::from_pointee(Vec::new()),
            strategy: LoadBalance::new(algorithm, session),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.strategy.algorithm()
    }

    pub fn strategy(&self) -> &LoadBalance {
        &self.strategy
    }

    /// Current candidate snapshot
    pub fn candidates(&self) -> Arc<Vec<Arc<Node>>> {
        self.candidates.load_full()
    }

    /// Replace the candidate snapshot with `nodes`
    pub fn rebuild(&self, nodes: &[Arc<Node>]) {
        let mut candidates = nodes.to_vec();
        if let LoadBalance::StickySession(_) = self.strategy {
            candidates.sort_by_key(|node| node.stable_hash());
        }
        self.candidates.store(Arc::new(candidates));
    }

    /// Drop every session entry pointing at `node`
    pub fn forget(&self, node: &Node) -> usize {
        self.strategy
            .sessions()
            .map_or(0, |sessions| sessions.remove(node))
    }

    /// Drop expired session entries
    pub fn sweep_sessions(&self) -> usize {
        self.strategy.sessions().map_or(0, SessionPersistence::sweep)
    }

    pub fn response(&self, request: &Request) -> Result<Response, LoadBalanceError> {
        let candidates = self.candidates.load();
        self.strategy
            .as_pick()
            .pick(&candidates, request)
            .ok_or_else(|| LoadBalanceError::NoNodeAvailable {
                cluster: self.cluster.clone(),
            })
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("cluster", &self.cluster)
            .field("algorithm", &self.algorithm())
            .field("candidates", &self.candidates.load().len())
            .finish()
    }
}
