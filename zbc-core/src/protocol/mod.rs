//! Broker wire protocol implementation.
//!
//! A message on the wire is
//! `FrameHeader | TransportHeader | [RequestResponseHeader] | MessageHeader | body | padding`.

mod codec;
pub mod constants;
pub mod header;
mod message;
mod reader;
pub mod sbe;
mod writer;

pub use codec::MessageCodec;
pub use constants::*;
pub use header::{
    FrameHeader, MessageHeader, RequestResponseHeader, TransportHeader, TransportProtocol,
};
pub use message::{Headers, Message};
pub use reader::MessageReader;
pub use sbe::{
    ControlMessageRequest, ControlMessageResponse, ControlMessageType, EventType,
    ExecuteCommandRequest, ExecuteCommandResponse, SbeMessage, SchemaBody, SubscribedEvent,
    SubscriptionType,
};
pub use writer::MessageWriter;
