/// Registry of per-node background services
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    HealthCheck,
    ConnectionCleaner,
    SessionSweeper,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::HealthCheck,
        ServiceKind::ConnectionCleaner,
        ServiceKind::SessionSweeper,
    ];
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::HealthCheck => write!(f, "health-check"),
            ServiceKind::ConnectionCleaner => write!(f, "connection-cleaner"),
            ServiceKind::SessionSweeper => write!(f, "session-sweeper"),
        }
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

/// At most one running instance per (owner, service kind).
///
/// Owners are node keys (`cluster/node`) or cluster names.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<(String, ServiceKind), RunningTask>,
    generations: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `service` for `owner`, cancelling any instance already running.
    ///
    /// The new task gets a child of `parent`, so cancelling `parent` stops it
    /// too. Returns the generation of the new instance.
    pub fn start<F, Fut>(&self, owner: &str, kind: ServiceKind, parent: &CancellationToken, service: F) -> u64
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let token = parent.child_token();

        match self.tasks.entry((owner.to_string(), kind)) {
            Entry::Occupied(mut entry) => {
                entry.get().token.cancel();
                let handle = tokio::spawn(service(token.clone()));
                entry.insert(RunningTask {
                    token,
                    handle,
                    generation,
                });
                debug!("Restarted {} for {} (generation {})", kind, owner, generation);
            }
            Entry::Vacant(entry) => {
                let handle = tokio::spawn(service(token.clone()));
                entry.insert(RunningTask {
                    token,
                    handle,
                    generation,
                });
                debug!("Started {} for {} (generation {})", kind, owner, generation);
            }
        }
        generation
    }

    /// Cancel one service; cancelling an absent service is a no-op
    pub fn cancel(&self, owner: &str, kind: ServiceKind) -> bool {
        match self.tasks.remove(&(owner.to_string(), kind)) {
            Some((_, task)) => {
                task.token.cancel();
                debug!("Cancelled {} for {}", kind, owner);
                true
            }
            None => false,
        }
    }

    /// Cancel every service of `owner`; returns how many were running
    pub fn cancel_all_for(&self, owner: &str) -> usize {
        ServiceKind::ALL
            .iter()
            .filter(|&&kind| self.cancel(owner, kind))
            .count()
    }

    pub fn cancel_all(&self) -> usize {
        let keys: Vec<_> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter(|(owner, kind)| self.cancel(owner, *kind))
            .count()
    }

    /// Cancel every service and wait for all of them to exit
    pub async fn drain(&self) -> usize {
        let keys: Vec<_> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let handles: Vec<_> = keys
            .into_iter()
            .filter_map(|key| self.tasks.remove(&key))
            .map(|(_, task)| {
                task.token.cancel();
                task.handle
            })
            .collect();

        let count = handles.len();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Background service ended abnormally: {}", e);
            }
        }
        count
    }

    pub fn is_running(&self, owner: &str, kind: ServiceKind) -> bool {
        self.tasks
            .get(&(owner.to_string(), kind))
            .map_or(false, |task| !task.handle.is_finished())
    }

    /// Generation of the registered instance, if any
    pub fn generation(&self, owner: &str, kind: ServiceKind) -> Option<u64> {
        self.tasks
            .get(&(owner.to_string(), kind))
            .map(|task| task.generation)
    }

    /// Number of instances started over the registry's lifetime
    pub fn started(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("running", &self.tasks.len())
            .field("started", &self.started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn park(token: CancellationToken, stopped: Arc<AtomicUsize>) {
        token.cancelled().await;
        stopped.fetch_add(1, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_restart_cancels_previous_instance() {
        let registry = TaskRegistry::new();
        let root = CancellationToken::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        let first = registry.start("web/a", ServiceKind::HealthCheck, &root, |t| {
            park(t, Arc::clone(&stopped))
        });
        let second = registry.start("web/a", ServiceKind::HealthCheck, &root, |t| {
            park(t, Arc::clone(&stopped))
        });
        assert!(second > first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.generation("web/a", ServiceKind::HealthCheck), Some(second));

        tokio::task::yield_now().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while stopped.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(registry.is_running("web/a", ServiceKind::HealthCheck));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let registry = TaskRegistry::new();
        let root = CancellationToken::new();
        registry.start("web/a", ServiceKind::ConnectionCleaner, &root, |t| async move {
            t.cancelled().await
        });

        assert!(registry.cancel("web/a", ServiceKind::ConnectionCleaner));
        assert!(!registry.cancel("web/a", ServiceKind::ConnectionCleaner));
        assert!(!registry.cancel("web/missing", ServiceKind::HealthCheck));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_for_owner() {
        let registry = TaskRegistry::new();
        let root = CancellationToken::new();
        for kind in [ServiceKind::HealthCheck, ServiceKind::ConnectionCleaner] {
            registry.start("web/a", kind, &root, |t| async move { t.cancelled().await });
        }
        registry.start("web/b", ServiceKind::HealthCheck, &root, |t| async move {
            t.cancelled().await
        });

        assert_eq!(registry.cancel_all_for("web/a"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.cancel_all(), 1);
        assert_eq!(registry.started(), 3);
    }

    #[tokio::test]
    async fn test_drain_waits_for_exit() {
        let registry = TaskRegistry::new();
        let root = CancellationToken::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        for owner in ["web/a", "web/b"] {
            registry.start(owner, ServiceKind::HealthCheck, &root, |t| {
                park(t, Arc::clone(&stopped))
            });
        }

        assert_eq!(registry.drain().await, 2);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.drain().await, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_children() {
        let registry = TaskRegistry::new();
        let root = CancellationToken::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        registry.start("web", ServiceKind::SessionSweeper, &root, |t| {
            park(t, Arc::clone(&stopped))
        });

        root.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while registry.is_running("web", ServiceKind::SessionSweeper) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
