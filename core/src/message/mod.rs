// Message module — envelope types and wire framing for the flood protocol

pub mod codec;
pub mod types;

pub use codec::{peek_message_type, WireError, HEADER_LEN, MAX_ENVELOPE_LEN};
pub use types::{
    AckMessageBody, MeshEnvelope, MessageId, MessageType, SendMessageBody, INITIAL_HOP_LIMIT,
    SEND_COMMAND,
};
