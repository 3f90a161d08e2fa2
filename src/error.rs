/// Unified error handling for portero
///
/// Routing failures (`LoadBalanceError`) and connection contract failures
/// (`ConnectionError`) are kept as their own enums because callers match on
/// them directly; everything else funnels into `PorteroError`.
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for portero operations
#[derive(Debug, Error)]
pub enum PorteroError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Node selection errors
    #[error("Load balancing error: {0}")]
    LoadBalance(#[from] LoadBalanceError),

    /// Connection pool and backlog errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Lookup or removal of a node that is not a cluster member
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// A node with the same id is already registered
    #[error("Node already exists: {id}")]
    NodeAlreadyExists { id: String },

    /// Lookup of a cluster that is not registered
    #[error("Cluster not found: {name}")]
    ClusterNotFound { name: String },

    /// A cluster with the same name is already registered
    #[error("Cluster already exists: {name}")]
    ClusterAlreadyExists { name: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Raised when no node can be selected for a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadBalanceError {
    #[error("no node available in cluster {cluster}")]
    NoNodeAvailable { cluster: String },
}

/// Connection lease, release and write failures
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("node {node} reached its connection limit of {max}")]
    TooManyConnections { node: String, max: usize },

    #[error("connection {id} is already leased")]
    InUse { id: u64 },

    #[error("connection {id} is not leased")]
    NotInUse { id: u64 },

    #[error("connection {id} is closed or failed")]
    Unavailable { id: u64 },

    #[error("node {node} is not accepting new connections")]
    NodeUnavailable { node: String },

    #[error("transport failure: {0}")]
    Transport(Arc<io::Error>),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for portero operations
pub type PorteroResult<T> = Result<T, PorteroError>;

impl PorteroError {
    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        PorteroError::NodeNotFound { id: id.into() }
    }

    pub fn node_already_exists<S: Into<String>>(id: S) -> Self {
        PorteroError::NodeAlreadyExists { id: id.into() }
    }

    pub fn cluster_not_found<S: Into<String>>(name: S) -> Self {
        PorteroError::ClusterNotFound { name: name.into() }
    }

    pub fn cluster_already_exists<S: Into<String>>(name: S) -> Self {
        PorteroError::ClusterAlreadyExists { name: name.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PorteroError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the caller may retry, possibly on another node)
    pub fn is_recoverable(&self) -> bool {
        match self {
            PorteroError::Network(_) => true,
            PorteroError::LoadBalance(_) => true,
            PorteroError::Connection(err) => err.is_recoverable(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PorteroError::Config(_) => ErrorSeverity::Critical,
            PorteroError::Internal { .. } => ErrorSeverity::Critical,
            PorteroError::Network(_) => ErrorSeverity::Warning,
            PorteroError::LoadBalance(_) => ErrorSeverity::Warning,
            PorteroError::Connection(err) if err.is_contract_violation() => ErrorSeverity::Error,
            PorteroError::Connection(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

impl ConnectionError {
    /// Lease/release misuse indicates a caller bug and must never be swallowed
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::InUse { .. } | ConnectionError::NotInUse { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionError::TooManyConnections { .. }
                | ConnectionError::NodeUnavailable { .. }
                | ConnectionError::Transport(_)
        )
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Transport(Arc::new(err))
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}
