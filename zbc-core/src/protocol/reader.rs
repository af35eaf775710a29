//! Async message reader over any byte stream.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use super::codec::MessageCodec;
use super::message::Message;
use crate::error::{Result, ZbcError};

/// Reads complete messages from a byte stream.
///
/// Partial reads are buffered across calls, including calls that time out, so
/// a timeout never loses or splits a frame.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: FramedRead<R, MessageCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Creates a reader with the default codec.
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, MessageCodec::new())
    }

    /// Creates a reader with the given codec.
    pub fn with_codec(reader: R, codec: MessageCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Reads the next message.
    ///
    /// # Errors
    ///
    /// - `ZbcError::Timeout` if no complete frame arrived within `timeout`;
    ///   the stream is still usable.
    /// - `ZbcError::Decode` if a frame was malformed; the frame is consumed
    ///   and the stream is still usable.
    /// - `ZbcError::ConnectionClosed` at end of stream.
    /// - Any other error means the stream can no longer be read.
    pub async fn read_message(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.inner.next()).await {
            Err(_) => Err(ZbcError::Timeout(format!(
                "no frame received within {:?}",
                timeout
            ))),
            Ok(None) => Err(ZbcError::ConnectionClosed("end of stream".to_string())),
            Ok(Some(Err(err))) => Err(err),
            Ok(Some(Ok(Err(decode)))) => Err(ZbcError::Decode(decode)),
            Ok(Some(Ok(Ok(message)))) => Ok(message),
        }
    }

    /// Returns the underlying reader, discarding buffered bytes.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}
