/// Pooled, leasable backend connection with a write backlog
///
/// A connection is handed out before its transport exists. Writes issued in
/// that window are queued and replayed, in order and exactly once, when the
/// connector reports the transport ready. If the connect fails, or the
/// connection is closed first, every queued write fails and its payload is
/// dropped.
use crate::core::node::Node;
use crate::core::transport::{write_pair, Completion, Transport, WriteHandle};
use crate::error::ConnectionError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Link state of a connection
enum Link {
    /// Transport still being established; writes wait here
    Connecting(VecDeque<(Bytes, Completion)>),
    Active(Arc<dyn Transport>),
    /// Transport could not be established or broke; no further writes
    Failed(Arc<io::Error>),
    /// Closed by the pool
    Closed,
}

impl Link {
    fn name(&self) -> &'static str {
        match self {
            Link::Connecting(_) => "connecting",
            Link::Active(_) => "active",
            Link::Failed(_) => "failed",
            Link::Closed => "closed",
        }
    }
}

pub struct Connection {
    id: u64,
    node: Weak<Node>,
    link: Mutex<Link>,
    in_use: AtomicBool,
    /// Set once a transport became ready
    established: AtomicBool,
    created_at: Instant,
    last_active: Mutex<Instant>,
}

impl Connection {
    /// Create a connection whose transport is still pending
    pub fn new(id: u64, node: Weak<Node>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            node,
            link: Mutex::new(Link::Connecting(VecDeque::new())),
            in_use: AtomicBool::new(false),
            established: AtomicBool::new(false),
            created_at: now,
            last_active: Mutex::new(now),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Forward a payload, queue it while connecting, or fail it when dead.
    ///
    /// Never blocks; the returned handle resolves once the transport is done
    /// with the payload.
    pub fn write_and_flush(&self, payload: Bytes) -> WriteHandle {
        let (completion, handle) = write_pair(self.id);
        self.touch();

        let mut link = self.link.lock();
        if let Link::Active(transport) = &*link {
            if !transport.is_active() {
                transport.close();
                debug!("Connection {} transport went away, refusing writes", self.id);
                *link = Link::Failed(Arc::new(io::Error::from(io::ErrorKind::NotConnected)));
            }
        }
        match &mut *link {
            Link::Active(transport) => transport.write(payload, completion),
            Link::Connecting(backlog) => backlog.push_back((payload, completion)),
            Link::Failed(_) | Link::Closed => {
                drop(payload);
                completion.fail(ConnectionError::Unavailable { id: self.id });
            }
        }

        handle
    }

    /// Transport is ready: replay the backlog and switch to direct writes.
    ///
    /// Returns `false` if the connection was closed or failed meanwhile, in
    /// which case the transport is closed right away.
    pub fn on_ready(&self, transport: Arc<dyn Transport>) -> bool {
        let mut link = self.link.lock();
        match std::mem::replace(&mut *link, Link::Active(Arc::clone(&transport))) {
            Link::Connecting(backlog) => {
                // Replaying under the lock keeps later writes behind the backlog.
                let replayed = backlog.len();
                for (payload, completion) in backlog {
                    transport.write(payload, completion);
                }
                drop(link);
                self.established.store(true, Ordering::Release);
                self.touch();
                trace!("Connection {} ready, replayed {} writes", self.id, replayed);
                true
            }
            previous => {
                *link = previous;
                drop(link);
                transport.close();
                false
            }
        }
    }

    /// Transport could not be established or broke.
    ///
    /// Fails every queued write with `cause` and stops accepting writes.
    pub fn on_failure(&self, cause: io::Error) {
        let cause = Arc::new(cause);
        let previous = {
            let mut link = self.link.lock();
            if matches!(&*link, Link::Failed(_) | Link::Closed) {
                return;
            }
            std::mem::replace(&mut *link, Link::Failed(Arc::clone(&cause)))
        };

        debug!("Connection {} failed: {}", self.id, cause);
        match previous {
            Link::Connecting(backlog) => {
                for (payload, completion) in backlog {
                    drop(payload);
                    completion.fail(ConnectionError::Transport(Arc::clone(&cause)));
                }
            }
            Link::Active(transport) => transport.close(),
            Link::Failed(_) | Link::Closed => {}
        }
    }

    /// Close the connection; pending writes fail with `Unavailable`
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.link.lock(), Link::Closed);
        match previous {
            Link::Connecting(backlog) => {
                for (payload, completion) in backlog {
                    drop(payload);
                    completion.fail(ConnectionError::Unavailable { id: self.id });
                }
            }
            Link::Active(transport) => transport.close(),
            Link::Failed(_) | Link::Closed => {}
        }
    }

    /// Whether the transport is established and alive
    pub fn is_active(&self) -> bool {
        matches!(&*self.link.lock(), Link::Active(transport) if transport.is_active())
    }

    /// Whether writes are still accepted (forwarded or queued)
    pub fn is_accepting(&self) -> bool {
        match &*self.link.lock() {
            Link::Connecting(_) => true,
            Link::Active(transport) => transport.is_active(),
            Link::Failed(_) | Link::Closed => false,
        }
    }

    pub fn backlog_len(&self) -> usize {
        match &*self.link.lock() {
            Link::Connecting(backlog) => backlog.len(),
            _ => 0,
        }
    }

    /// Whether the cleaner may reclaim this connection at `now`.
    ///
    /// A connection that never got a transport is measured against
    /// `connect_timeout` from creation; an established one against
    /// `idle_timeout` from its last activity. Either way the transport must
    /// not be active.
    pub fn is_expired(&self, now: Instant, connect_timeout: Duration, idle_timeout: Duration) -> bool {
        if self.is_active() {
            return false;
        }

        if !self.established.load(Ordering::Acquire) {
            now.saturating_duration_since(self.created_at) >= connect_timeout
        } else {
            now.saturating_duration_since(self.last_active()) >= idle_timeout
        }
    }

    /// Mark the connection in use and hand it out
    pub fn lease(self: &Arc<Self>) -> Result<Arc<Self>, ConnectionError> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConnectionError::InUse { id: self.id })?;
        self.touch();
        Ok(Arc::clone(self))
    }

    /// Give the connection back to its node's pool
    pub fn release(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConnectionError::NotInUse { id: self.id })?;
        self.touch();

        if let Some(node) = self.node.upgrade() {
            node.return_connection(self);
        }
        Ok(())
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("link", &self.link.lock().name())
            .field("in_use", &self.is_in_use())
            .finish_non_exhaustive()
    }
}
