//! Fixed-layout message bodies.
//!
//! Every body is a fixed block of `BLOCK_LENGTH` bytes followed by zero or more
//! variable-length fields, each a `u16` length and that many bytes.
//!
//! Decoding reads exactly `header.block_length` block bytes. Fields that lie
//! beyond a shorter block take their null value and extra block bytes from a
//! newer schema are skipped. A variable field missing entirely at the end of
//! the body decodes as empty; a partially present one is an error. Bytes after
//! the last known variable field are left unread.

use bytes::{Buf, BufMut, Bytes};

use super::constants::*;
use super::header::MessageHeader;
use crate::error::{DecodeError, Result, ZbcError};

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// The null sentinel.
            Null,
            /// A code this client does not know.
            Unknown(u8),
        }

        impl $name {
            /// Returns the wire code.
            pub fn code(self) -> u8 {
                match self {
                    $( $name::$variant => $code, )+
                    $name::Null => NULL_U8,
                    $name::Unknown(code) => code,
                }
            }
        }

        impl From<u8> for $name {
            fn from(code: u8) -> Self {
                match code {
                    $( $code => $name::$variant, )+
                    NULL_U8 => $name::Null,
                    other => $name::Unknown(other),
                }
            }
        }
    };
}

code_enum! {
    /// Kind of record carried in a command or event.
    pub enum EventType {
        /// Task record.
        Task = 0,
        /// Raft record.
        Raft = 1,
        /// Subscriber record.
        Subscriber = 2,
        /// Subscription record.
        Subscription = 3,
        /// Deadline record.
        Deadline = 4,
        /// Workflow record.
        Workflow = 5,
        /// Incident record.
        Incident = 6,
        /// Workflow instance record.
        WorkflowInstance = 7,
        /// Deployment record.
        Deployment = 8,
        /// Topic record.
        Topic = 9,
    }
}

code_enum! {
    /// Operation requested by a control message.
    pub enum ControlMessageType {
        /// Open a task subscription.
        AddTaskSubscription = 0,
        /// Close a task subscription.
        RemoveTaskSubscription = 1,
        /// Grant more credits to a task subscription.
        IncreaseTaskSubscriptionCredits = 2,
        /// Close a topic subscription.
        RemoveTopicSubscription = 3,
        /// Ask for the cluster topology.
        RequestTopology = 4,
        /// Ask for the partition list.
        RequestPartitions = 5,
    }
}

code_enum! {
    /// Kind of subscription an event was pushed for.
    pub enum SubscriptionType {
        /// Task subscription.
        Task = 0,
        /// Topic subscription.
        Topic = 1,
    }
}

/// A body with a fixed schema layout.
pub trait SbeMessage: Sized {
    /// Length of the fixed block this client writes.
    const BLOCK_LENGTH: u16;
    /// Template identifier.
    const TEMPLATE_ID: u16;
    /// Schema identifier.
    const SCHEMA_ID: u16 = SCHEMA_ID;
    /// Schema version.
    const SCHEMA_VERSION: u16 = SCHEMA_VERSION;

    /// Returns the schema header describing this body.
    fn message_header() -> MessageHeader {
        MessageHeader {
            block_length: Self::BLOCK_LENGTH,
            template_id: Self::TEMPLATE_ID,
            schema_id: Self::SCHEMA_ID,
            version: Self::SCHEMA_VERSION,
        }
    }

    /// Bytes written by [`SbeMessage::encode`].
    fn encoded_len(&self) -> usize;

    /// Writes the fixed block and variable fields.
    fn encode(&self, dst: &mut impl BufMut) -> Result<()>;

    /// Reads the body described by `header` from `src`.
    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError>;
}

/// Fixed block of a body as received, with null defaults for absent fields.
struct Block(Bytes);

impl Block {
    fn take(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let len = header.block_length as usize;
        if src.len() < len {
            return Err(DecodeError::LengthMismatch {
                declared: src.len(),
                required: len,
            });
        }
        Ok(Block(src.split_to(len)))
    }

    fn u8_at(&self, offset: usize) -> u8 {
        self.0.get(offset).copied().unwrap_or(NULL_U8)
    }

    fn u16_at(&self, offset: usize) -> u16 {
        self.0
            .get(offset..offset + 2)
            .and_then(|b| b.try_into().ok())
            .map(u16::from_le_bytes)
            .unwrap_or(NULL_U16)
    }

    fn u64_at(&self, offset: usize) -> u64 {
        self.0
            .get(offset..offset + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(NULL_U64)
    }
}

fn get_var_data(src: &mut Bytes) -> std::result::Result<Bytes, DecodeError> {
    if src.is_empty() {
        return Ok(Bytes::new());
    }
    if src.len() < VAR_DATA_LENGTH_SIZE {
        return Err(DecodeError::LengthMismatch {
            declared: src.len(),
            required: VAR_DATA_LENGTH_SIZE,
        });
    }
    let len = src.get_u16_le() as usize;
    if src.len() < len {
        return Err(DecodeError::LengthMismatch {
            declared: src.len(),
            required: len,
        });
    }
    Ok(src.split_to(len))
}

fn get_var_string(
    src: &mut Bytes,
    field: &'static str,
) -> std::result::Result<String, DecodeError> {
    let raw = get_var_data(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn put_var_data(dst: &mut impl BufMut, field: &'static str, data: &[u8]) -> Result<()> {
    if data.len() > MAX_VAR_DATA_LENGTH {
        return Err(ZbcError::FieldTooLong {
            field,
            len: data.len(),
            max: MAX_VAR_DATA_LENGTH,
        });
    }
    dst.put_u16_le(data.len() as u16);
    dst.put_slice(data);
    Ok(())
}

fn var_len(data: &[u8]) -> usize {
    VAR_DATA_LENGTH_SIZE + data.len()
}

/// Command sent to a partition leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteCommandRequest {
    /// Target partition.
    pub partition_id: u16,
    /// Record key, or null for new records.
    pub key: u64,
    /// Kind of record in `command`.
    pub event_type: EventType,
    /// Topic the partition belongs to.
    pub topic_name: String,
    /// Msgpack-encoded command record.
    pub command: Bytes,
}

impl ExecuteCommandRequest {
    /// Creates a command for a new record; the partition is filled in by routing.
    pub fn new(topic_name: impl Into<String>, event_type: EventType, command: Bytes) -> Self {
        Self {
            partition_id: NULL_U16,
            key: NULL_U64,
            event_type,
            topic_name: topic_name.into(),
            command,
        }
    }

    /// Sets the record key.
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = key;
        self
    }

    /// Sets the target partition.
    pub fn with_partition(mut self, partition_id: u16) -> Self {
        self.partition_id = partition_id;
        self
    }
}

impl SbeMessage for ExecuteCommandRequest {
    const BLOCK_LENGTH: u16 = 11;
    const TEMPLATE_ID: u16 = TEMPLATE_EXECUTE_COMMAND_REQUEST;

    fn encoded_len(&self) -> usize {
        Self::BLOCK_LENGTH as usize + var_len(self.topic_name.as_bytes()) + var_len(&self.command)
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16_le(self.partition_id);
        dst.put_u64_le(self.key);
        dst.put_u8(self.event_type.code());
        put_var_data(dst, "topic_name", self.topic_name.as_bytes())?;
        put_var_data(dst, "command", &self.command)
    }

    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let block = Block::take(header, src)?;
        Ok(Self {
            partition_id: block.u16_at(0),
            key: block.u64_at(2),
            event_type: EventType::from(block.u8_at(10)),
            topic_name: get_var_string(src, "topic_name")?,
            command: get_var_data(src)?,
        })
    }
}

/// Broker reply to an [`ExecuteCommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteCommandResponse {
    /// Partition that processed the command.
    pub partition_id: u16,
    /// Key of the resulting record.
    pub key: u64,
    /// Topic the partition belongs to.
    pub topic_name: String,
    /// Msgpack-encoded resulting record.
    pub event: Bytes,
}

impl SbeMessage for ExecuteCommandResponse {
    const BLOCK_LENGTH: u16 = 10;
    const TEMPLATE_ID: u16 = TEMPLATE_EXECUTE_COMMAND_RESPONSE;

    fn encoded_len(&self) -> usize {
        Self::BLOCK_LENGTH as usize + var_len(self.topic_name.as_bytes()) + var_len(&self.event)
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16_le(self.partition_id);
        dst.put_u64_le(self.key);
        put_var_data(dst, "topic_name", self.topic_name.as_bytes())?;
        put_var_data(dst, "event", &self.event)
    }

    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let block = Block::take(header, src)?;
        Ok(Self {
            partition_id: block.u16_at(0),
            key: block.u64_at(2),
            topic_name: get_var_string(src, "topic_name")?,
            event: get_var_data(src)?,
        })
    }
}

/// Cluster-level request that is not a record command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessageRequest {
    /// Requested operation.
    pub message_type: ControlMessageType,
    /// Target partition, or null when the request is not partition scoped.
    pub partition_id: u16,
    /// Msgpack-encoded request data.
    pub data: Bytes,
}

impl ControlMessageRequest {
    /// Creates a control request not bound to a partition.
    pub fn new(message_type: ControlMessageType, data: Bytes) -> Self {
        Self {
            message_type,
            partition_id: NULL_U16,
            data,
        }
    }

    /// Sets the target partition.
    pub fn with_partition(mut self, partition_id: u16) -> Self {
        self.partition_id = partition_id;
        self
    }
}

impl SbeMessage for ControlMessageRequest {
    const BLOCK_LENGTH: u16 = 3;
    const TEMPLATE_ID: u16 = TEMPLATE_CONTROL_MESSAGE_REQUEST;

    fn encoded_len(&self) -> usize {
        Self::BLOCK_LENGTH as usize + var_len(&self.data)
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u8(self.message_type.code());
        dst.put_u16_le(self.partition_id);
        put_var_data(dst, "data", &self.data)
    }

    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let block = Block::take(header, src)?;
        Ok(Self {
            message_type: ControlMessageType::from(block.u8_at(0)),
            partition_id: block.u16_at(1),
            data: get_var_data(src)?,
        })
    }
}

/// Broker reply to a [`ControlMessageRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessageResponse {
    /// Msgpack-encoded response data.
    pub data: Bytes,
}

impl SbeMessage for ControlMessageResponse {
    const BLOCK_LENGTH: u16 = 0;
    const TEMPLATE_ID: u16 = TEMPLATE_CONTROL_MESSAGE_RESPONSE;

    fn encoded_len(&self) -> usize {
        var_len(&self.data)
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        put_var_data(dst, "data", &self.data)
    }

    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        Block::take(header, src)?;
        Ok(Self {
            data: get_var_data(src)?,
        })
    }
}

/// Event pushed by the broker to an open subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribedEvent {
    /// Partition the event was written to.
    pub partition_id: u16,
    /// Log position of the event.
    pub position: u64,
    /// Record key.
    pub key: u64,
    /// Subscription the event is delivered to.
    pub subscriber_key: u64,
    /// Kind of subscription.
    pub subscription_type: SubscriptionType,
    /// Kind of record in `event`.
    pub event_type: EventType,
    /// Topic the partition belongs to.
    pub topic_name: String,
    /// Msgpack-encoded record.
    pub event: Bytes,
}

impl SbeMessage for SubscribedEvent {
    const BLOCK_LENGTH: u16 = 28;
    const TEMPLATE_ID: u16 = TEMPLATE_SUBSCRIBED_EVENT;

    fn encoded_len(&self) -> usize {
        Self::BLOCK_LENGTH as usize + var_len(self.topic_name.as_bytes()) + var_len(&self.event)
    }

    fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u16_le(self.partition_id);
        dst.put_u64_le(self.position);
        dst.put_u64_le(self.key);
        dst.put_u64_le(self.subscriber_key);
        dst.put_u8(self.subscription_type.code());
        dst.put_u8(self.event_type.code());
        put_var_data(dst, "topic_name", self.topic_name.as_bytes())?;
        put_var_data(dst, "event", &self.event)
    }

    fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        let block = Block::take(header, src)?;
        Ok(Self {
            partition_id: block.u16_at(0),
            position: block.u64_at(2),
            key: block.u64_at(10),
            subscriber_key: block.u64_at(18),
            subscription_type: SubscriptionType::from(block.u8_at(26)),
            event_type: EventType::from(block.u8_at(27)),
            topic_name: get_var_string(src, "topic_name")?,
            event: get_var_data(src)?,
        })
    }
}

/// Any body this client can send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaBody {
    /// Template 20.
    ExecuteCommandRequest(ExecuteCommandRequest),
    /// Template 21.
    ExecuteCommandResponse(ExecuteCommandResponse),
    /// Template 10.
    ControlMessageRequest(ControlMessageRequest),
    /// Template 11.
    ControlMessageResponse(ControlMessageResponse),
    /// Template 30.
    SubscribedEvent(SubscribedEvent),
}

impl SchemaBody {
    /// Decodes the body named by `header`.
    pub fn decode(header: &MessageHeader, src: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        if header.schema_id != SCHEMA_ID {
            return Err(DecodeError::UnsupportedSchema {
                schema_id: header.schema_id,
                version: header.version,
            });
        }

        let body = match header.template_id {
            TEMPLATE_EXECUTE_COMMAND_REQUEST => {
                SchemaBody::ExecuteCommandRequest(ExecuteCommandRequest::decode(header, src)?)
            }
            TEMPLATE_EXECUTE_COMMAND_RESPONSE => {
                SchemaBody::ExecuteCommandResponse(ExecuteCommandResponse::decode(header, src)?)
            }
            TEMPLATE_CONTROL_MESSAGE_REQUEST => {
                SchemaBody::ControlMessageRequest(ControlMessageRequest::decode(header, src)?)
            }
            TEMPLATE_CONTROL_MESSAGE_RESPONSE => {
                SchemaBody::ControlMessageResponse(ControlMessageResponse::decode(header, src)?)
            }
            TEMPLATE_SUBSCRIBED_EVENT => {
                SchemaBody::SubscribedEvent(SubscribedEvent::decode(header, src)?)
            }
            other => return Err(DecodeError::UnknownTemplate(other)),
        };
        Ok(body)
    }

    /// Returns the schema header this body is written with.
    pub fn message_header(&self) -> MessageHeader {
        match self {
            SchemaBody::ExecuteCommandRequest(_) => ExecuteCommandRequest::message_header(),
            SchemaBody::ExecuteCommandResponse(_) => ExecuteCommandResponse::message_header(),
            SchemaBody::ControlMessageRequest(_) => ControlMessageRequest::message_header(),
            SchemaBody::ControlMessageResponse(_) => ControlMessageResponse::message_header(),
            SchemaBody::SubscribedEvent(_) => SubscribedEvent::message_header(),
        }
    }

    /// Bytes written by [`SchemaBody::encode`].
    pub fn encoded_len(&self) -> usize {
        match self {
            SchemaBody::ExecuteCommandRequest(m) => m.encoded_len(),
            SchemaBody::ExecuteCommandResponse(m) => m.encoded_len(),
            SchemaBody::ControlMessageRequest(m) => m.encoded_len(),
            SchemaBody::ControlMessageResponse(m) => m.encoded_len(),
            SchemaBody::SubscribedEvent(m) => m.encoded_len(),
        }
    }

    /// Writes the body.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            SchemaBody::ExecuteCommandRequest(m) => m.encode(dst),
            SchemaBody::ExecuteCommandResponse(m) => m.encode(dst),
            SchemaBody::ControlMessageRequest(m) => m.encode(dst),
            SchemaBody::ControlMessageResponse(m) => m.encode(dst),
            SchemaBody::SubscribedEvent(m) => m.encode(dst),
        }
    }

    /// Returns the opaque msgpack payload of the body.
    pub fn payload(&self) -> &Bytes {
        match self {
            SchemaBody::ExecuteCommandRequest(m) => &m.command,
            SchemaBody::ExecuteCommandResponse(m) => &m.event,
            SchemaBody::ControlMessageRequest(m) => &m.data,
            SchemaBody::ControlMessageResponse(m) => &m.data,
            SchemaBody::SubscribedEvent(m) => &m.event,
        }
    }
}

macro_rules! impl_from_body {
    ($($variant:ident),+) => {
        $(
            impl From<$variant> for SchemaBody {
                fn from(body: $variant) -> Self {
                    SchemaBody::$variant(body)
                }
            }
        )+
    };
}

impl_from_body!(
    ExecuteCommandRequest,
    ExecuteCommandResponse,
    ControlMessageRequest,
    ControlMessageResponse,
    SubscribedEvent
);
