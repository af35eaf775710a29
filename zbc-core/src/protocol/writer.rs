//! Serializes messages into aligned frames.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::{align, FRAME_HEADER_SIZE};
use super::header::{FrameHeader, TransportProtocol};
use super::message::Message;
use crate::error::{Result, ZbcError};

/// Writes messages in the exact on-wire layout.
///
/// The frame header is written with a placeholder length, the rest of the
/// message follows, then the real length is patched in and the frame is
/// zero-padded to the next 8-byte boundary. Padding is not part of the length.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageWriter;

impl MessageWriter {
    /// Creates a writer.
    pub fn new() -> Self {
        Self
    }

    /// Serializes `message` into a new buffer.
    pub fn write_message(&self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(align(FRAME_HEADER_SIZE + message.frame_length()));
        self.write_to(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Appends `message` to `dst`. On error `dst` is left unchanged.
    pub fn write_to(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        let result = self.write_frame(message, dst, start);
        if result.is_err() {
            dst.truncate(start);
        }
        result
    }

    fn write_frame(&self, message: &Message, dst: &mut BytesMut, start: usize) -> Result<()> {
        let headers = &message.headers;
        let expects_correlation = headers.transport.protocol == TransportProtocol::RequestResponse;
        if expects_correlation != headers.request_response.is_some() {
            return Err(ZbcError::Protocol(format!(
                "{:?} message with correlation header present: {}",
                headers.transport.protocol,
                headers.request_response.is_some()
            )));
        }

        dst.reserve(align(FRAME_HEADER_SIZE + message.frame_length()));

        FrameHeader {
            length: 0,
            ..headers.frame
        }
        .encode(dst);
        headers.transport.encode(dst);
        if let Some(request_response) = &headers.request_response {
            request_response.encode(dst);
        }
        message.body.message_header().encode(dst);
        message.body.encode(dst)?;

        let written = dst.len() - start;
        let length = u32::try_from(written - FRAME_HEADER_SIZE).map_err(|_| {
            ZbcError::Protocol(format!("frame of {} bytes exceeds u32 length", written))
        })?;
        dst[start..start + 4].copy_from_slice(&length.to_le_bytes());

        dst.put_bytes(0, align(written) - written);
        Ok(())
    }
}
