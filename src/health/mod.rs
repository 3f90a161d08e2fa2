/// Active health checking of backend nodes
pub mod http;
pub mod scheduler;
pub mod tcp;
pub mod udp;
pub mod window;

pub use http::HttpProbe;
pub use tcp::TcpProbe;
pub use udp::UdpProbe;
pub use window::SampleWindow;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SAMPLES: usize = 100;
pub const DEFAULT_RISE: usize = 3;
pub const DEFAULT_FALL: usize = 3;

/// Why a single probe did not pass.
///
/// Probe errors never leave the scheduler; they only become failed samples.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("probe task panicked")]
    Panicked,
}

/// Health probe trait
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Probe `addr` once; must give up within `timeout`
    async fn check(&self, addr: SocketAddr, timeout: Duration) -> Result<(), ProbeError>;

    /// Protocol name used in logs
    fn name(&self) -> &'static str;
}

/// Health check descriptor attached to a node
#[derive(Clone)]
pub struct HealthCheck {
    pub probe: Arc<dyn HealthProbe>,
    pub interval: Duration,
    pub timeout: Duration,
    /// Size of the rolling sample window
    pub samples: usize,
    /// Consecutive passes that make a node GOOD
    pub rise: usize,
    /// Consecutive failures that make a node BAD
    pub fall: usize,
}

impl HealthCheck {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            probe,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            samples: DEFAULT_SAMPLES,
            rise: DEFAULT_RISE,
            fall: DEFAULT_FALL,
        }
    }

    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpProbe))
    }

    pub fn udp() -> Self {
        Self::new(Arc::new(UdpProbe))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, samples: usize, rise: usize, fall: usize) -> Self {
        self.samples = samples;
        self.rise = rise;
        self.fall = fall;
        self
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("probe", &self.probe.name())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("samples", &self.samples)
            .field("rise", &self.rise)
            .field("fall", &self.fall)
            .finish()
    }
}
