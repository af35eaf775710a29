//! Codec implementation for framing protocol messages.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::header::FrameHeader;
use super::message::Message;
use super::writer::MessageWriter;
use crate::error::{DecodeError, Result, ZbcError};

/// Codec for encoding and decoding framed messages.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O.
///
/// Framing is separated from parsing: once a complete frame is buffered its
/// bytes and trailing alignment padding are consumed before the body is parsed.
/// A malformed body therefore yields `Some(Err(DecodeError))` and the next call
/// starts on the following frame. Only an oversized length, which makes the
/// stream impossible to resynchronize, is returned as a hard error.
#[derive(Debug)]
pub struct MessageCodec {
    max_frame_length: usize,
    /// Padding bytes of the previous frame not yet consumed.
    pending_padding: usize,
    writer: MessageWriter,
}

impl MessageCodec {
    /// Creates a codec with the default frame length limit.
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Creates a codec that rejects frames longer than `max_frame_length`.
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            pending_padding: 0,
            writer: MessageWriter::new(),
        }
    }

    /// Returns the frame length limit.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn skip_padding(&mut self, src: &mut BytesMut) {
        let skip = self.pending_padding.min(src.len());
        src.advance(skip);
        self.pending_padding -= skip;
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ZbcError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.writer.write_to(&item, dst)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ZbcError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        self.writer.write_to(item, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = std::result::Result<Message, DecodeError>;
    type Error = ZbcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            self.skip_padding(src);
            if self.pending_padding > 0 || src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let frame = FrameHeader::decode(&mut &src[..FRAME_HEADER_SIZE])?;
            let length = frame.length as usize;
            if length > self.max_frame_length {
                return Err(ZbcError::Protocol(format!(
                    "frame length {} exceeds limit {}",
                    length, self.max_frame_length
                )));
            }

            let total = FRAME_HEADER_SIZE + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut frame_bytes = src.split_to(total).freeze();
            frame_bytes.advance(FRAME_HEADER_SIZE);
            self.pending_padding = align(total) - total;

            if frame.is_skippable() {
                tracing::trace!(type_id = frame.type_id, length, "skipping frame");
                continue;
            }
            if !frame.is_message() {
                return Ok(Some(Err(DecodeError::UnexpectedFrameType(frame.type_id))));
            }

            return Ok(Some(Message::decode(frame, frame_bytes)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => Err(ZbcError::ConnectionClosed(format!(
                "stream ended inside a frame with {} bytes buffered",
                src.len()
            ))),
        }
    }
}
