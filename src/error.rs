//! # Voltage Modbus Proxy Error Handling
//!
//! Error types for every stage of the proxy pipeline: frame decoding on the
//! client side, pooled upstream transport, the retry engine, read splitting,
//! and lifecycle/configuration management.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket read/write failures on either side of the proxy
//! - **Timeouts**: operations that exceeded their configured deadline
//! - **Connection Closed**: clean end-of-stream from a peer
//!
//! ### Protocol Errors
//! - **Invalid Length / Malformed Frame**: MBAP violations on ingress
//! - **Malformed Response**: upstream responses that fail validation
//! - **Aggregation Too Large**: a stitched read response that cannot be
//!   framed within the 253-byte PDU bound
//!
//! ### Resource Errors
//! - **Pool Exhausted / Pool Closed**: upstream connection pool conditions
//! - **Upstream Unavailable**: all forward attempts failed
//!
//! ### Lifecycle Errors
//! - **Bind**: listener could not be bound
//! - **Cancelled**: shutdown observed mid-operation
//! - **Configuration**: rejected proxy configuration
//!
//! Recoverability drives the forward engine's retry loop:
//!
//! ```rust
//! use voltage_modbus_proxy::ProxyError;
//!
//! let err = ProxyError::pool_exhausted(5000);
//! assert!(err.is_recoverable());
//!
//! let err = ProxyError::PoolClosed;
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors produced by the proxy core
///
/// Each variant corresponds to one failure kind in the pipeline. Transport
/// variants carry enough context for log lines; protocol variants carry the
/// offending values for diagnostics.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// I/O related errors (client or upstream sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// A peer closed its connection cleanly (end-of-stream)
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Operation exceeded its deadline
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// MBAP length field outside the accepted [1, 300] range
    #[error("invalid MBAP length: {length}")]
    InvalidLength { length: u16 },

    /// A request frame that cannot be parsed
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// An upstream response frame that fails validation
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    /// No pooled connection became available within the acquire deadline
    #[error("connection pool exhausted after {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    /// Acquire attempted on a closed pool
    #[error("connection pool is closed")]
    PoolClosed,

    /// Every forward attempt failed; wraps the last attempt's error
    #[error("upstream unavailable after {attempts} attempts: {message}")]
    UpstreamUnavailable { attempts: u32, message: String },

    /// A stitched read payload exceeds the 253-byte PDU bound
    #[error("aggregated response too large: {bytes} payload bytes")]
    AggregationTooLarge { bytes: usize },

    /// Listener bind failure
    #[error("bind error: {message}")]
    Bind { message: String },

    /// Shutdown was signalled while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Rejected proxy configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ProxyError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a malformed frame error
    pub fn malformed_frame<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    /// Create a malformed response error
    pub fn malformed_response<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse { message: message.into() }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(timeout_ms: u64) -> Self {
        Self::PoolExhausted { timeout_ms }
    }

    /// Create an upstream unavailable error from the last attempt's failure
    pub fn upstream_unavailable(attempts: u32, last: &ProxyError) -> Self {
        Self::UpstreamUnavailable {
            attempts,
            message: last.to_string(),
        }
    }

    /// Create a bind error
    pub fn bind<S: Into<String>>(message: S) -> Self {
        Self::Bind { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Check if the error is recoverable (another attempt may succeed)
    ///
    /// The forward engine keeps retrying on recoverable errors and aborts
    /// its attempt loop on everything else.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::MalformedResponse { .. }
                | Self::PoolExhausted { .. }
        )
    }

    /// Check if the error means shutdown rather than failure
    ///
    /// Cancellation-class errors exit the session loops silently instead of
    /// counting as upstream failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::PoolClosed)
    }

    /// Check if the error is a protocol violation
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidLength { .. }
                | Self::MalformedFrame { .. }
                | Self::MalformedResponse { .. }
                | Self::AggregationTooLarge { .. }
        )
    }
}

/// Convert from std::io::Error
///
/// A clean end-of-stream maps to `ConnectionClosed` so session loops can
/// tell an orderly disconnect from a failure.
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation timeout", 0)
    }
}

/// Convert from serde JSON errors (config store)
impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(ProxyError::io("reset by peer").is_recoverable());
        assert!(ProxyError::pool_exhausted(5000).is_recoverable());
        assert!(ProxyError::malformed_response("short").is_recoverable());

        assert!(!ProxyError::PoolClosed.is_recoverable());
        assert!(!ProxyError::Cancelled.is_recoverable());
        assert!(!ProxyError::InvalidLength { length: 0 }.is_recoverable());
    }

    #[test]
    fn test_cancellation_class() {
        assert!(ProxyError::Cancelled.is_cancellation());
        assert!(ProxyError::PoolClosed.is_cancellation());
        assert!(!ProxyError::io("broken pipe").is_cancellation());
    }

    #[test]
    fn test_io_eof_maps_to_connection_closed() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ProxyError::from(eof), ProxyError::ConnectionClosed));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProxyError::from(refused), ProxyError::Io { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ProxyError::InvalidLength { length: 400 };
        assert!(format!("{}", err).contains("400"));

        let last = ProxyError::io("connection reset");
        let err = ProxyError::upstream_unavailable(3, &last);
        let msg = format!("{}", err);
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
