//! A complete protocol message: the header stack plus a decoded body.

use bytes::Bytes;

use super::header::{
    FrameHeader, MessageHeader, RequestResponseHeader, TransportHeader, TransportProtocol,
};
use super::sbe::SchemaBody;
use crate::error::DecodeError;

/// Headers preceding a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    /// Frame header. Its length is recomputed when the message is written.
    pub frame: FrameHeader,
    /// Transport header.
    pub transport: TransportHeader,
    /// Correlation header, absent on single messages.
    pub request_response: Option<RequestResponseHeader>,
    /// Schema header.
    pub message: MessageHeader,
}

impl Headers {
    /// Returns true for uncorrelated broker pushes.
    pub fn is_single_message(&self) -> bool {
        self.transport.protocol == TransportProtocol::FullDuplexSingleMessage
    }
}

/// A message as sent or received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header stack.
    pub headers: Headers,
    /// Decoded body.
    pub body: SchemaBody,
}

impl Message {
    /// Creates a correlated request/response message.
    pub fn request(request_id: u64, body: impl Into<SchemaBody>) -> Self {
        let body = body.into();
        Self {
            headers: Headers {
                frame: FrameHeader::message(0),
                transport: TransportHeader::new(TransportProtocol::RequestResponse),
                request_response: Some(RequestResponseHeader::new(request_id)),
                message: body.message_header(),
            },
            body,
        }
    }

    /// Creates an uncorrelated single message.
    pub fn single(body: impl Into<SchemaBody>) -> Self {
        let body = body.into();
        Self {
            headers: Headers {
                frame: FrameHeader::message(0),
                transport: TransportHeader::new(TransportProtocol::FullDuplexSingleMessage),
                request_response: None,
                message: body.message_header(),
            },
            body,
        }
    }

    /// Returns the transaction id of a request/response message.
    pub fn request_id(&self) -> Option<u64> {
        self.headers.request_response.map(|h| h.request_id)
    }

    /// Stamps a transaction id onto a request/response message.
    pub fn set_request_id(&mut self, request_id: u64) {
        self.headers.transport = TransportHeader::new(TransportProtocol::RequestResponse);
        self.headers.request_response = Some(RequestResponseHeader::new(request_id));
    }

    /// Returns the subscriber key of a pushed subscription event.
    pub fn subscriber_key(&self) -> Option<u64> {
        match &self.body {
            SchemaBody::SubscribedEvent(event) if self.headers.is_single_message() => {
                Some(event.subscriber_key)
            }
            _ => None,
        }
    }

    /// Returns the opaque msgpack payload of the body.
    pub fn payload(&self) -> &Bytes {
        self.body.payload()
    }

    /// Bytes after the frame header, excluding padding.
    pub fn frame_length(&self) -> usize {
        let correlation = if self.headers.request_response.is_some() {
            RequestResponseHeader::SIZE
        } else {
            0
        };
        TransportHeader::SIZE + correlation + MessageHeader::SIZE + self.body.encoded_len()
    }

    /// Decodes the part of a message frame that follows its frame header.
    ///
    /// `src` holds exactly `frame.length` bytes.
    pub fn decode(frame: FrameHeader, mut src: Bytes) -> Result<Self, DecodeError> {
        let transport = TransportHeader::decode(&mut src)?;
        let request_response = match transport.protocol {
            TransportProtocol::RequestResponse => Some(RequestResponseHeader::decode(&mut src)?),
            TransportProtocol::FullDuplexSingleMessage => None,
        };
        let message = MessageHeader::decode(&mut src)?;
        let body = SchemaBody::decode(&message, &mut src)?;

        Ok(Self {
            headers: Headers {
                frame,
                transport,
                request_response,
                message,
            },
            body,
        })
    }
}
