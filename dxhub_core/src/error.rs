//! Error taxonomy shared by DataBlock, Producer, Consumer, and Messenger.
//!
//! Every public fallible function returns [`HubResult<T>`]. Thread top-levels
//! (peer/write/ctrl/data/shm threads, the Messenger worker) catch both
//! returned errors and panics, logging at error level and setting a
//! per-service fault flag rather than letting the failure cross a thread
//! boundary as an exception.

use thiserror::Error;

/// Result alias used throughout `dxhub_core`.
pub type HubResult<T> = Result<T, HubError>;

/// The five-way error taxonomy: protocol, transient, liveness, integrity, fatal.
#[derive(Error, Debug)]
pub enum HubError {
    /// Schema mismatch, unknown request type, malformed JSON body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Broker not reachable, `CHANNEL_NOT_READY`, slot-acquisition timeout.
    /// Callers retry within their own timeout budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// Heartbeat timeout or a dead pid was discovered; recovery is automatic
    /// but the condition is still reported.
    #[error("liveness error: {0}")]
    Liveness(String),

    /// Bad magic, secret mismatch, or checksum failure.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Shared-memory init failed, ZMQ bind/connect failed, or any condition
    /// that should fail `start()` outright.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Acquire-write or acquire-read did not complete within its timeout.
    #[error("operation timed out")]
    Timeout,

    /// No slot was available and the caller asked for a non-blocking attempt.
    #[error("no slot available")]
    NoSlot,

    /// A write exceeded the channel's fixed `slot_bytes` stride.
    #[error("payload of {got} bytes exceeds slot_bytes ({slot_bytes})")]
    SizeOverflow { slot_bytes: usize, got: usize },

    /// Slot or flex-zone checksum did not match on read.
    #[error("checksum mismatch on channel '{channel}'")]
    ChecksumMismatch { channel: String },

    /// Requested channel does not exist at the broker.
    #[error("channel '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for conditions that don't fit the taxonomy above but still
    /// need to be reported as a typed error rather than panicking.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<String> for HubError {
    fn from(s: String) -> Self {
        HubError::Internal(s)
    }
}

impl From<&str> for HubError {
    fn from(s: &str) -> Self {
        HubError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_overflow_message_includes_both_sizes() {
        let err = HubError::SizeOverflow { slot_bytes: 64, got: 65 };
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("65"));
    }

    #[test]
    fn string_conversion_is_internal() {
        let err: HubError = "boom".to_string().into();
        assert!(matches!(err, HubError::Internal(_)));
    }
}
