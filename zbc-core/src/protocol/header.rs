//! Fixed-size headers that precede every message on the wire.
//!
//! All fields are little-endian. Each header knows its own size and refuses
//! to decode from a buffer that is too short.

use bytes::{Buf, BufMut};

use super::constants::*;
use crate::error::DecodeError;

fn ensure(src: &impl Buf, what: &'static str, needed: usize) -> Result<(), DecodeError> {
    if src.remaining() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            available: src.remaining(),
        });
    }
    Ok(())
}

/// Outermost header of every frame.
///
/// `length` counts the bytes after this header up to the end of the schema
/// body. Alignment padding is not included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the frame header.
    pub length: u32,
    /// Frame format version.
    pub version: u8,
    /// Frame flags.
    pub flags: u8,
    /// Frame type, see the `FRAME_TYPE_*` constants.
    pub type_id: u16,
    /// Stream the frame belongs to.
    pub stream_id: u32,
}

impl FrameHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = FRAME_HEADER_SIZE;

    /// Creates a message frame header with the given length.
    pub fn message(length: u32) -> Self {
        Self {
            length,
            version: FRAME_VERSION,
            flags: 0,
            type_id: FRAME_TYPE_MESSAGE,
            stream_id: DEFAULT_STREAM_ID,
        }
    }

    /// Returns true if the frame carries a message.
    pub fn is_message(&self) -> bool {
        self.type_id == FRAME_TYPE_MESSAGE
    }

    /// Returns true if the reader should silently discard this frame.
    pub fn is_skippable(&self) -> bool {
        matches!(self.type_id, FRAME_TYPE_PADDING | FRAME_TYPE_KEEP_ALIVE)
    }

    /// Writes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.length);
        dst.put_u8(self.version);
        dst.put_u8(self.flags);
        dst.put_u16_le(self.type_id);
        dst.put_u32_le(self.stream_id);
    }

    /// Reads the header.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, "frame header", Self::SIZE)?;
        Ok(Self {
            length: src.get_u32_le(),
            version: src.get_u8(),
            flags: src.get_u8(),
            type_id: src.get_u16_le(),
            stream_id: src.get_u32_le(),
        })
    }
}

/// Transport protocol named by the transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// Correlated request/response; a `RequestResponseHeader` follows.
    RequestResponse,
    /// Uncorrelated single message pushed by the broker.
    FullDuplexSingleMessage,
}

impl TransportProtocol {
    /// Returns the wire identifier.
    pub fn id(self) -> u16 {
        match self {
            TransportProtocol::RequestResponse => PROTOCOL_REQUEST_RESPONSE,
            TransportProtocol::FullDuplexSingleMessage => PROTOCOL_FULL_DUPLEX_SINGLE_MESSAGE,
        }
    }
}

impl TryFrom<u16> for TransportProtocol {
    type Error = DecodeError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        match id {
            PROTOCOL_REQUEST_RESPONSE => Ok(TransportProtocol::RequestResponse),
            PROTOCOL_FULL_DUPLEX_SINGLE_MESSAGE => Ok(TransportProtocol::FullDuplexSingleMessage),
            other => Err(DecodeError::UnknownProtocol(other)),
        }
    }
}

/// Second header of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    /// The protocol of the rest of the frame.
    pub protocol: TransportProtocol,
}

impl TransportHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = TRANSPORT_HEADER_SIZE;

    /// Creates a transport header.
    pub fn new(protocol: TransportProtocol) -> Self {
        Self { protocol }
    }

    /// Writes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.protocol.id());
    }

    /// Reads the header, rejecting unknown protocol ids.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, "transport header", Self::SIZE)?;
        let protocol = TransportProtocol::try_from(src.get_u16_le())?;
        Ok(Self { protocol })
    }
}

/// Correlation header present on request/response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestResponseHeader {
    /// Transaction id echoed back by the broker.
    pub request_id: u64,
}

impl RequestResponseHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = REQUEST_RESPONSE_HEADER_SIZE;

    /// Creates a header for the given transaction id.
    pub fn new(request_id: u64) -> Self {
        Self { request_id }
    }

    /// Writes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64_le(self.request_id);
    }

    /// Reads the header.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, "request/response header", Self::SIZE)?;
        Ok(Self {
            request_id: src.get_u64_le(),
        })
    }
}

/// Schema header that identifies the body layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Length of the fixed block of the body.
    pub block_length: u16,
    /// Body template.
    pub template_id: u16,
    /// Schema the template belongs to.
    pub schema_id: u16,
    /// Schema version.
    pub version: u16,
}

impl MessageHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = MESSAGE_HEADER_SIZE;

    /// Writes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(self.block_length);
        dst.put_u16_le(self.template_id);
        dst.put_u16_le(self.schema_id);
        dst.put_u16_le(self.version);
    }

    /// Reads the header.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, "message header", Self::SIZE)?;
        Ok(Self {
            block_length: src.get_u16_le(),
            template_id: src.get_u16_le(),
            schema_id: src.get_u16_le(),
            version: src.get_u16_le(),
        })
    }
}
