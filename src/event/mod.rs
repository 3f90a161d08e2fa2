/// Node lifecycle events and the in-process bus that fans them out
///
/// Every subscriber owns an unbounded channel, so a slow subscriber never
/// blocks publishers and each subscriber sees events in publish order.
use crate::core::Node;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    Added,
    Removed,
    Online,
    Idle,
    Offline,
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEventKind::Added => write!(f, "node-added"),
            NodeEventKind::Removed => write!(f, "node-removed"),
            NodeEventKind::Online => write!(f, "node-online"),
            NodeEventKind::Idle => write!(f, "node-idle"),
            NodeEventKind::Offline => write!(f, "node-offline"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node: Arc<Node>,
    pub success: bool,
    pub cause: Option<Arc<str>>,
}

impl NodeEvent {
    pub fn success(kind: NodeEventKind, node: Arc<Node>) -> Self {
        Self {
            kind,
            node,
            success: true,
            cause: None,
        }
    }

    pub fn failure<S: Into<Arc<str>>>(kind: NodeEventKind, node: Arc<Node>, cause: S) -> Self {
        Self {
            kind,
            node,
            success: false,
            cause: Some(cause.into()),
        }
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<NodeEvent>,
    kinds: Option<Vec<NodeEventKind>>,
}

impl Subscriber {
    fn wants(&self, kind: NodeEventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Cheap-to-clone handle onto a shared subscriber list
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event
    pub fn subscribe(&self) -> Subscription {
        self.register(None)
    }

    /// Receive only the given kinds
    pub fn subscribe_to(&self, kinds: &[NodeEventKind]) -> Subscription {
        self.register(Some(kinds.to_vec()))
    }

    fn register(&self, kinds: Option<Vec<NodeEventKind>>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { tx, kinds });
        Subscription { rx }
    }

    /// Deliver an event to every interested subscriber.
    ///
    /// Returns how many subscribers received it. Subscribers whose
    /// `Subscription` was dropped are pruned here.
    pub fn publish(&self, event: NodeEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.wants(event.kind)) {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(
            "Published {} for {} to {} subscribers",
            event.kind,
            event.node.key(),
            delivered
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        subscribers.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once every bus handle is gone
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NodeEvent> {
        self.rx.try_recv().ok()
    }
}
