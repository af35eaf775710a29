//! Protocol constants for the broker wire format.

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the transport header in bytes.
pub const TRANSPORT_HEADER_SIZE: usize = 2;

/// Size of the request/response header in bytes.
pub const REQUEST_RESPONSE_HEADER_SIZE: usize = 8;

/// Size of the schema message header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Size of the length prefix in front of every variable-length field.
pub const VAR_DATA_LENGTH_SIZE: usize = 2;

/// Maximum length of a variable-length field.
pub const MAX_VAR_DATA_LENGTH: usize = u16::MAX as usize;

/// Frames are padded to a multiple of this many bytes.
pub const FRAME_ALIGNMENT: usize = 8;

/// Default upper bound on a frame length accepted by the reader.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

// Frame type identifiers.

/// Frame carrying a message.
pub const FRAME_TYPE_MESSAGE: u16 = 0;
/// Filler frame, skipped by the reader.
pub const FRAME_TYPE_PADDING: u16 = 1;
/// Control frame requesting the channel be closed.
pub const FRAME_TYPE_CONTROL_CLOSE: u16 = 101;
/// Control frame marking end of stream.
pub const FRAME_TYPE_CONTROL_END_OF_STREAM: u16 = 102;
/// Keep-alive control frame, skipped by the reader.
pub const FRAME_TYPE_KEEP_ALIVE: u16 = 103;
/// Protocol control frame.
pub const FRAME_TYPE_PROTOCOL_CONTROL: u16 = 104;

/// Frame header version written by this client.
pub const FRAME_VERSION: u8 = 0;

/// Stream id stamped on every message frame this client writes.
pub const DEFAULT_STREAM_ID: u32 = 2;

// Transport protocol identifiers.

/// Request/response exchange, followed by a request/response header.
pub const PROTOCOL_REQUEST_RESPONSE: u16 = 0;
/// Unsolicited single message, no correlation header.
pub const PROTOCOL_FULL_DUPLEX_SINGLE_MESSAGE: u16 = 1;

// Schema identity.

/// Schema id of all client protocol messages.
pub const SCHEMA_ID: u16 = 0;
/// Schema version of all client protocol messages.
pub const SCHEMA_VERSION: u16 = 1;

// Template identifiers.

/// Control message request template.
pub const TEMPLATE_CONTROL_MESSAGE_REQUEST: u16 = 10;
/// Control message response template.
pub const TEMPLATE_CONTROL_MESSAGE_RESPONSE: u16 = 11;
/// Execute command request template.
pub const TEMPLATE_EXECUTE_COMMAND_REQUEST: u16 = 20;
/// Execute command response template.
pub const TEMPLATE_EXECUTE_COMMAND_RESPONSE: u16 = 21;
/// Subscribed event template.
pub const TEMPLATE_SUBSCRIBED_EVENT: u16 = 30;

// Null sentinels.

/// Null value of a u8 enum field.
pub const NULL_U8: u8 = u8::MAX;
/// Null value of a u16 field.
pub const NULL_U16: u16 = u16::MAX;
/// Null value of a u64 field.
pub const NULL_U64: u64 = u64::MAX;

/// Rounds `len` up to the frame alignment.
pub const fn align(len: usize) -> usize {
    (len + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}
