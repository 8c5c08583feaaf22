// Message types — the envelope that floods the mesh and the bodies it carries

use serde::{Deserialize, Serialize};

use crate::identity::PeerIdentity;

/// Random per-message identifier, unique together with the sender
pub type MessageId = i32;

/// Hop limit stamped on every locally originated envelope
pub const INITIAL_HOP_LIMIT: i32 = 4;

/// Command code carried by application data bodies
pub const SEND_COMMAND: i32 = 4;

/// Envelope kind, the first field of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Acknowledgement of a previously sent message
    Ack,
    /// Application data addressed to one node or to everyone
    SendMessage,
    /// Reply to a SendMessage
    ReceiveMessage,
    /// Any code this node does not understand
    Unknown(i32),
}

impl MessageType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MessageType::Ack,
            1 => MessageType::SendMessage,
            2 => MessageType::ReceiveMessage,
            other => MessageType::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            MessageType::Ack => 0,
            MessageType::SendMessage => 1,
            MessageType::ReceiveMessage => 2,
            MessageType::Unknown(code) => *code,
        }
    }
}

/// The routed unit of the flood protocol.
///
/// `(message_id, sender)` identifies an envelope network-wide. Relays only
/// ever lower `hop_limit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshEnvelope {
    pub message_type: MessageType,
    pub hop_limit: i32,
    pub message_id: MessageId,
    pub sender: PeerIdentity,
    /// Encoded body; its length is written as the header's body length
    pub body: Vec<u8>,
}

impl MeshEnvelope {
    pub fn new(
        message_type: MessageType,
        hop_limit: i32,
        message_id: MessageId,
        sender: PeerIdentity,
        body: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            hop_limit,
            message_id,
            sender,
            body,
        }
    }

    /// Build a SendMessage envelope around an encoded body
    pub fn send_message(
        hop_limit: i32,
        message_id: MessageId,
        sender: PeerIdentity,
        body: &SendMessageBody,
    ) -> Self {
        Self::new(
            MessageType::SendMessage,
            hop_limit,
            message_id,
            sender,
            body.encode(),
        )
    }

    /// Build an Ack envelope answering `message_id`
    pub fn ack(
        hop_limit: i32,
        message_id: MessageId,
        sender: PeerIdentity,
        body: &AckMessageBody,
    ) -> Self {
        Self::new(MessageType::Ack, hop_limit, message_id, sender, body.encode())
    }

    /// Copy of this envelope one hop further along
    pub fn relayed(&self) -> Self {
        Self {
            hop_limit: self.hop_limit - 1,
            ..self.clone()
        }
    }
}

/// Body of a SendMessage envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageBody {
    pub command: i32,
    pub is_broadcast: bool,
    /// `None` travels as the nil identity
    pub destination: Option<PeerIdentity>,
    pub msg: Vec<u8>,
}

impl SendMessageBody {
    /// Body for data addressed to a single node
    pub fn to(destination: PeerIdentity, msg: Vec<u8>) -> Self {
        Self {
            command: SEND_COMMAND,
            is_broadcast: false,
            destination: Some(destination),
            msg,
        }
    }

    /// Body for data every node should deliver
    pub fn broadcast(msg: Vec<u8>) -> Self {
        Self {
            command: SEND_COMMAND,
            is_broadcast: true,
            destination: None,
            msg,
        }
    }

    pub fn is_for(&self, identity: &PeerIdentity) -> bool {
        self.destination.as_ref() == Some(identity)
    }
}

/// Body of an Ack envelope: a short status text such as "ok".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessageBody {
    pub message: String,
}

impl AckMessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
