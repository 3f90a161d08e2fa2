/// HTTP GET probe
use super::{HealthProbe, ProbeError};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::net::SocketAddr;
use std::time::Duration;

/// Issues `GET <uri>` against the node and passes on a 2xx or 3xx status.
///
/// Redirects are reported, not followed.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    uri: String,
    tls: bool,
    client: Client,
}

impl HttpProbe {
    pub fn new<S: Into<String>>(uri: S, tls: bool, validate_tls: bool) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(!validate_tls)
            .build()
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let mut uri = uri.into();
        if !uri.starts_with('/') {
            uri.insert(0, '/');
        }
        Ok(Self { uri, tls, client })
    }

    pub fn url(&self, addr: SocketAddr) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, addr, self.uri)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, addr: SocketAddr, limit: Duration) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(self.url(addr))
            .timeout(limit)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(limit)
                } else {
                    ProbeError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering with `status_line`
    async fn serve_once(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buffer = [0u8; 1024];
                let _ = stream.read(&mut buffer).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nLocation: /elsewhere\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[test]
    fn test_url_building() {
        let probe = HttpProbe::new("health", false, true).unwrap();
        assert_eq!(
            probe.url("127.0.0.1:8080".parse().unwrap()),
            "http://127.0.0.1:8080/health"
        );

        let probe = HttpProbe::new("/ready", true, false).unwrap();
        assert_eq!(probe.url("[::1]:443".parse().unwrap()), "https://[::1]:443/ready");
    }

    #[tokio::test]
    async fn test_http_probe_accepts_success() {
        let addr = serve_once("200 OK").await;
        let probe = HttpProbe::new("/health", false, true).unwrap();
        assert!(probe.check(addr, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_accepts_redirect_without_following() {
        let addr = serve_once("302 Found").await;
        let probe = HttpProbe::new("/health", false, true).unwrap();
        assert!(probe.check(addr, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_rejects_server_error() {
        let addr = serve_once("503 Service Unavailable").await;
        let probe = HttpProbe::new("/health", false, true).unwrap();
        let result = probe.check(addr, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Status(503))));
    }
}
