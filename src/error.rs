//! Error types for cluster-bridge
//!
//! Errors are categorized by subsystem. Per-connection and per-query errors
//! stay local to the task that hit them; fatal errors ascend to the top-level
//! runner, which decides on the exit code.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for cluster-bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Proxy IP pool errors
    #[error("IP pool error: {0}")]
    Pool(#[from] PoolError),

    /// DNS interception errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Transparent proxy errors
    #[error("Transparent proxy error: {0}")]
    Tproxy(#[from] TproxyError),

    /// Tunnel transport errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// In-cluster proxy server errors
    #[error("Proxy server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Pool(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Tproxy(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Server(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid CIDR, bad pattern, duplicate listen port)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Proxy IP pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// No free addresses remain in the configured CIDR
    #[error("proxy IP pool exhausted: all {size} addresses allocated")]
    Exhausted { size: usize },
}

impl PoolError {
    /// Exhaustion recovers once entries expire and are released
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// DNS interception errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// No upstream nameserver available for fallthrough
    #[error("no upstream nameserver configured")]
    NoUpstream,

    /// Upstream query failed or timed out
    #[error("upstream query to {upstream} failed: {reason}")]
    UpstreamFailed { upstream: SocketAddr, reason: String },

    /// Failed to encode a DNS response
    #[error("failed to encode DNS response: {0}")]
    EncodeError(String),

    /// I/O error
    #[error("DNS I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DnsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoUpstream => false,
            Self::UpstreamFailed { .. } | Self::EncodeError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create an upstream failure error
    pub fn upstream(upstream: SocketAddr, reason: impl Into<String>) -> Self {
        Self::UpstreamFailed {
            upstream,
            reason: reason.into(),
        }
    }
}

/// Transparent proxy errors
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to bind the proxy listener
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to accept a connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Failed to recover the original destination
    #[error("Failed to get original destination: {0}")]
    OriginalDstError(String),

    /// Failed to install or remove kernel redirect rules
    #[error("Redirect rule error: {0}")]
    RedirectError(String),

    /// I/O error
    #[error("Transparent proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TproxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::AcceptError(_) | Self::OriginalDstError(_) | Self::RedirectError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Tunnel frame decoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unknown frame type byte
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Frame ended before a field could be decoded
    #[error("truncated frame while decoding {field}: expected {expected} bytes, {available} available")]
    Truncated {
        field: &'static str,
        expected: usize,
        available: usize,
    },

    /// Frame exceeds the maximum allowed size
    #[error("frame oversized: {size} bytes, max {max}")]
    Oversized { size: usize, max: usize },

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in {0}")]
    InvalidString(&'static str),
}

/// Tunnel transport errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Tunnel URL could not be parsed
    #[error("invalid tunnel URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// TCP or WebSocket connection to the tunnel endpoint failed
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Registration exchange failed
    #[error("tunnel registration failed: {0}")]
    RegistrationFailed(String),

    /// Frame codec error
    #[error("tunnel protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The tunnel is closed; no frames can be sent
    #[error("tunnel closed")]
    Closed,

    /// The tunnel stream failed; every logical connection has been torn down
    #[error("tunnel failed: {0}")]
    Fatal(String),

    /// DNS resolve RPC did not answer within the deadline
    #[error("tunnel DNS resolve timed out")]
    ResolveTimeout,

    /// The remote resolver reported an error for this hostname
    #[error("tunnel DNS resolve failed: {0}")]
    ResolveFailed(String),

    /// I/O error
    #[error("tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidUrl { .. } | Self::RegistrationFailed(_) => false,
            Self::ConnectFailed { .. } | Self::ResolveTimeout | Self::ResolveFailed(_) => true,
            Self::Protocol(_) | Self::Closed | Self::Fatal(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a connect error
    pub fn connect(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// In-cluster proxy server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the tunnel or an ingress listener
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// A tunnel is already active; only one is accepted at a time
    #[error("a tunnel is already active")]
    TunnelAlreadyActive,

    /// I/O error
    #[error("Proxy server I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::TunnelAlreadyActive => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `BridgeError`
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError("test".into());
        assert!(!config_err.is_recoverable());

        let pool_err = PoolError::Exhausted { size: 65534 };
        assert!(pool_err.is_recoverable());

        let tproxy_err = TproxyError::AcceptError("test".into());
        assert!(tproxy_err.is_recoverable());

        let fatal = TunnelError::Fatal("stream reset".into());
        assert!(!fatal.is_recoverable());

        let resolve = TunnelError::ResolveTimeout;
        assert!(resolve.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::Exhausted { size: 65534 };
        assert!(err.to_string().contains("65534"));

        let err = TunnelError::connect("10.0.0.8:4600", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.8:4600"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let bridge_err: BridgeError = io_err.into();
        assert!(bridge_err.is_recoverable());

        let config_err = ConfigError::ValidationError("invalid".into());
        let bridge_err: BridgeError = config_err.into();
        assert!(!bridge_err.is_recoverable());
    }
}
