/// Per-node fixed-delay health check loop
use super::{HealthCheck, ProbeError};
use crate::core::{Health, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Probe `node` every `check.interval` until `token` is cancelled.
///
/// The delay is measured from the end of one probe to the start of the next.
/// A failing, hanging or panicking probe only ever yields a failed sample.
pub async fn run(node: Arc<Node>, check: HealthCheck, token: CancellationToken) {
    debug!(
        "Starting {} health check for node {} every {:?}",
        check.probe.name(),
        node.key(),
        check.interval
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(check.interval) => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = probe_once(&check, node.addr()) => result,
        };

        let health = match result {
            Ok(()) => node.record_sample(true),
            Err(e) => {
                debug!("Health probe for node {} failed: {}", node.key(), e);
                node.record_sample(false)
            }
        };
        if health == Health::Bad {
            warn!("Node {} health is {}", node.key(), health);
        }
        node.apply_health(health);
    }

    debug!("Health check for node {} stopped", node.key());
}

/// Run one probe in its own task, bounded by the check timeout
pub async fn probe_once(check: &HealthCheck, addr: SocketAddr) -> Result<(), ProbeError> {
    let probe = Arc::clone(&check.probe);
    let limit = check.timeout;

    let task = tokio::spawn(async move { timeout(limit, probe.check(addr, limit)).await });
    match task.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ProbeError::Timeout(limit)),
        Err(e) if e.is_panic() => Err(ProbeError::Panicked),
        Err(e) => Err(ProbeError::Http(e.to_string())),
    }
}
