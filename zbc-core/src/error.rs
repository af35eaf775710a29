//! Error types for broker client operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while decoding a single frame.
///
/// A decode error is scoped to the frame it was raised for: the framing layer
/// has already consumed the frame's bytes, so the stream stays aligned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes were available than a fixed-size structure requires.
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        /// The structure being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// The transport header named a protocol this client does not speak.
    #[error("unknown transport protocol id {0}")]
    UnknownProtocol(u16),

    /// The schema header named a template this client does not know.
    #[error("unknown template id {0}")]
    UnknownTemplate(u16),

    /// The schema header named a schema id or version this client does not know.
    #[error("unsupported schema {schema_id} version {version}")]
    UnsupportedSchema {
        /// Schema id from the header.
        schema_id: u16,
        /// Schema version from the header.
        version: u16,
    },

    /// The schema body needs more bytes than the enclosing frame declared.
    #[error("frame declares {declared} bytes but body needs {required}")]
    LengthMismatch {
        /// Length declared in the frame header.
        declared: usize,
        /// Length the body needs.
        required: usize,
    },

    /// The frame type is neither a message nor a skippable control frame.
    #[error("unexpected frame type {0}")]
    UnexpectedFrameType(u16),

    /// A string field is not valid UTF-8.
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

/// The main error type for broker client operations.
#[derive(Debug, Error)]
pub enum ZbcError {
    /// A frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Connection-related errors (dial failures, broken sockets).
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection was closed while the operation was in flight.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A socket write accepted fewer bytes than the encoded message.
    #[error("short socket write: expected {expected} bytes, wrote {written}")]
    SocketWrite {
        /// Bytes in the encoded message.
        expected: usize,
        /// Bytes actually written.
        written: usize,
    },

    /// Operation timeout errors.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// No partition leader is known for the topic.
    #[error("no leader known for topic {0}")]
    TopicLeaderNotFound(String),

    /// No broker address is known for the partition.
    #[error("no broker known for partition {0}")]
    PartitionNotFound(u16),

    /// The topology contains no brokers.
    #[error("no brokers found in cluster topology")]
    NoBrokersFound,

    /// The retry policy gave up.
    #[error("retry deadline reached after {attempts} attempts in {elapsed:?}: {last_error}")]
    RetryDeadlineReached {
        /// Number of attempts made.
        attempts: u32,
        /// Time spent retrying.
        elapsed: Duration,
        /// Error of the final attempt.
        last_error: Box<ZbcError>,
    },

    /// A variable-length field does not fit its u16 length prefix.
    #[error("field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum encodable length.
        max: usize,
    },

    /// Protocol-related errors (oversized frames, inconsistent headers).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload (msgpack) serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The broker processed the command but rejected it.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The broker answered with a message of the wrong kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ZbcError {
    /// Returns true if the failed operation may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZbcError::Connection(_)
                | ZbcError::ConnectionClosed(_)
                | ZbcError::SocketWrite { .. }
                | ZbcError::Timeout(_)
                | ZbcError::TopicLeaderNotFound(_)
                | ZbcError::PartitionNotFound(_)
                | ZbcError::NoBrokersFound
                | ZbcError::Io(_)
        )
    }

    /// Returns true if the error suggests the cached topology is out of date.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            ZbcError::Connection(_)
                | ZbcError::ConnectionClosed(_)
                | ZbcError::SocketWrite { .. }
                | ZbcError::Timeout(_)
                | ZbcError::TopicLeaderNotFound(_)
                | ZbcError::PartitionNotFound(_)
                | ZbcError::NoBrokersFound
                | ZbcError::Io(_)
        )
    }

    /// Returns true if retrying can never change the outcome.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

/// A specialized `Result` type for broker client operations.
pub type Result<T> = std::result::Result<T, ZbcError>;
