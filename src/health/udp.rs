/// UDP echo probe
use super::{HealthProbe, ProbeError};
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const PING: &[u8; 4] = b"PING";
const PONG: &[u8; 4] = b"PONG";

/// Sends `PING` and passes when `PING` or `PONG` comes back within the timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpProbe;

impl UdpProbe {
    async fn exchange(addr: SocketAddr) -> Result<(), ProbeError> {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        socket.send(PING).await?;

        let mut buffer = [0u8; 64];
        let received = socket.recv(&mut buffer).await?;
        let reply = &buffer[..received];
        if reply == PING || reply == PONG {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedReply(
                String::from_utf8_lossy(reply).into_owned(),
            ))
        }
    }
}

#[async_trait]
impl HealthProbe for UdpProbe {
    async fn check(&self, addr: SocketAddr, limit: Duration) -> Result<(), ProbeError> {
        timeout(limit, Self::exchange(addr))
            .await
            .map_err(|_| ProbeError::Timeout(limit))?
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn responder(reply: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 16];
            if let Ok((_, peer)) = socket.recv_from(&mut buffer).await {
                let _ = socket.send_to(reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_probe_accepts_pong() {
        let addr = responder(b"PONG").await;
        assert!(UdpProbe.check(addr, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_udp_probe_accepts_echo() {
        let addr = responder(b"PING").await;
        assert!(UdpProbe.check(addr, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_udp_probe_rejects_other_reply() {
        let addr = responder(b"NOPE").await;
        let result = UdpProbe.check(addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::UnexpectedReply(reply)) if reply == "NOPE"));
    }

    #[tokio::test]
    async fn test_udp_probe_times_out_on_silence() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let result = UdpProbe.check(addr, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        drop(silent);
    }
}
