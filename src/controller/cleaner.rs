/// Background sweeps: expired connections per node, expired sessions per cluster
use crate::core::{Cluster, Node};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sweep `node`'s pools every `interval` until cancelled
pub async fn run(node: Arc<Node>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let removed = node.sweep_connections();
        if removed > 0 {
            debug!("Cleaned up {} expired connections on node {}", removed, node.key());
        }
    }
}

/// Drop `cluster`'s expired session entries every `interval` until cancelled
pub async fn sweep_sessions(cluster: Arc<Cluster>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let removed = cluster.balancer().sweep_sessions();
        if removed > 0 {
            debug!("Cleaned up {} expired sessions in cluster {}", removed, cluster.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::Algorithm;
    use crate::core::transport::{MemoryConnectMode, MemoryConnector};
    use crate::core::{ClusterSettings, NodeSpec, Request};
    use crate::event::EventBus;

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_reclaims_stale_connections() {
        let cluster = Cluster::with_connector(
            "clean",
            ClusterSettings::default(),
            EventBus::new(),
            Arc::new(MemoryConnector::new(MemoryConnectMode::Hang)),
        );
        let node = cluster
            .add_node(NodeSpec::new("a", "127.0.0.1:1".parse().unwrap()))
            .unwrap();
        let stale = node.connection().unwrap();
        stale.release().unwrap();
        assert_eq!(node.active_connections(), 1);

        let token = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&node), Duration::from_secs(1), token.clone()));

        tokio::time::sleep(cluster.settings().connect_timeout + Duration::from_secs(2)).await;
        assert_eq!(node.active_connections(), 0);
        assert_eq!(node.available_connections(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_sweeper_drops_expired_entries() {
        let mut settings = ClusterSettings::default().with_algorithm(Algorithm::FourTupleHash);
        settings.session.ttl = Duration::from_secs(10);
        let cluster = Cluster::new("sessions", settings, EventBus::new());
        cluster
            .add_node(NodeSpec::new("a", "127.0.0.1:1".parse().unwrap()))
            .unwrap();
        cluster
            .next_node(&Request::new("10.0.0.1:1000".parse().unwrap()))
            .unwrap();
        let sessions = cluster.balancer().strategy().sessions().unwrap();
        assert_eq!(sessions.len(), 1);

        let token = CancellationToken::new();
        let task = tokio::spawn(sweep_sessions(
            Arc::clone(&cluster),
            Duration::from_secs(5),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(sessions.len(), 0);

        token.cancel();
        task.await.unwrap();
    }
}
