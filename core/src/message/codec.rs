// Message codec — fixed-width big-endian framing for envelopes and bodies
//
// Header: [type: i32 | hop_limit: i32 | message_id: i32 | sender: 16 | body_len: i32]
// SendMessage body: [command: i32 | is_broadcast: u8 | destination: 16 | msg_len: i32 | msg]
// Ack body: [msg_len: i32 | msg (UTF-8)]

use thiserror::Error;

use super::types::{AckMessageBody, MeshEnvelope, MessageType, SendMessageBody};
use crate::identity::PeerIdentity;

/// Size of the envelope header in bytes
pub const HEADER_LEN: usize = 4 + 4 + 4 + PeerIdentity::LEN + 4;

/// Size of a SendMessage body without its payload
pub const SEND_BODY_PREFIX_LEN: usize = 4 + 1 + PeerIdentity::LEN + 4;

/// Largest envelope this node will encode or accept: 64 KB
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Header too short: {0} bytes (need 32)")]
    HeaderTooShort(usize),
    #[error("Truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Negative length field: {0}")]
    NegativeLength(i32),
    #[error("Envelope too large: {0} bytes (max 65536)")]
    TooLarge(usize),
    #[error("Invalid identity: {0} bytes")]
    InvalidIdentity(usize),
    #[error("Ack text is not UTF-8")]
    InvalidText,
}

/// Cursor over a received buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                expected: end,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn identity(&mut self) -> Result<PeerIdentity, WireError> {
        PeerIdentity::from_slice(self.take(PeerIdentity::LEN)?)
    }

    fn length(&mut self) -> Result<usize, WireError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        Ok(len as usize)
    }
}

impl MeshEnvelope {
    /// Serialize header and body
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let total = HEADER_LEN + self.body.len();
        if total > MAX_ENVELOPE_LEN {
            return Err(WireError::TooLarge(total));
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.message_type.code().to_be_bytes());
        out.extend_from_slice(&self.hop_limit.to_be_bytes());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.sender.to_bytes());
        out.extend_from_slice(&(self.body.len() as i32).to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Parse header and body. Bytes past the declared body are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_ENVELOPE_LEN {
            return Err(WireError::TooLarge(bytes.len()));
        }
        if bytes.len() < HEADER_LEN {
            return Err(WireError::HeaderTooShort(bytes.len()));
        }

        let mut reader = Reader::new(bytes);
        let message_type = MessageType::from_code(reader.i32()?);
        let hop_limit = reader.i32()?;
        let message_id = reader.i32()?;
        let sender = reader.identity()?;
        let body_len = reader.length()?;
        let body = reader.take(body_len)?.to_vec();

        Ok(Self {
            message_type,
            hop_limit,
            message_id,
            sender,
            body,
        })
    }

    /// Decode the body as application data
    pub fn send_body(&self) -> Result<SendMessageBody, WireError> {
        SendMessageBody::decode(&self.body)
    }

    /// Decode the body as an acknowledgement
    pub fn ack_body(&self) -> Result<AckMessageBody, WireError> {
        AckMessageBody::decode(&self.body)
    }
}

impl SendMessageBody {
    pub fn encode(&self) -> Vec<u8> {
        let destination = self.destination.unwrap_or_else(PeerIdentity::nil);
        let mut out = Vec::with_capacity(SEND_BODY_PREFIX_LEN + self.msg.len());
        out.extend_from_slice(&self.command.to_be_bytes());
        out.push(u8::from(self.is_broadcast));
        out.extend_from_slice(&destination.to_bytes());
        out.extend_from_slice(&(self.msg.len() as i32).to_be_bytes());
        out.extend_from_slice(&self.msg);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let command = reader.i32()?;
        let is_broadcast = reader.u8()? != 0;
        let destination = reader.identity()?;
        let msg_len = reader.length()?;
        let msg = reader.take(msg_len)?.to_vec();

        Ok(Self {
            command,
            is_broadcast,
            destination: (!destination.is_nil()).then_some(destination),
            msg,
        })
    }
}

impl AckMessageBody {
    pub fn encode(&self) -> Vec<u8> {
        let text = self.message.as_bytes();
        let mut out = Vec::with_capacity(4 + text.len());
        out.extend_from_slice(&(text.len() as i32).to_be_bytes());
        out.extend_from_slice(text);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let msg_len = reader.length()?;
        let text = reader.take(msg_len)?;
        let message = std::str::from_utf8(text)
            .map_err(|_| WireError::InvalidText)?
            .to_string();
        Ok(Self { message })
    }
}

/// Read only the message type of an encoded envelope.
pub fn peek_message_type(bytes: &[u8]) -> Result<MessageType, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::HeaderTooShort(bytes.len()));
    }
    Reader::new(bytes).i32().map(MessageType::from_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshEnvelope {
        let body = SendMessageBody::to(PeerIdentity::random(), b"payload".to_vec());
        MeshEnvelope::send_message(4, 42, PeerIdentity::random(), &body)
    }

    #[test]
    fn test_header_len() {
        assert_eq!(HEADER_LEN, 32);
        assert_eq!(SEND_BODY_PREFIX_LEN, 25);
    }

    #[test]
    fn test_encode_decode_envelope() {
        let env = sample();
        let bytes = env.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + env.body.len());

        let decoded = MeshEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.send_body().unwrap().msg, b"payload");
    }

    #[test]
    fn test_short_header_rejected() {
        assert_eq!(
            MeshEnvelope::decode(&[0u8; 31]),
            Err(WireError::HeaderTooShort(31))
        );
        assert!(peek_message_type(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            MeshEnvelope::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_negative_body_length_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[28..32].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(
            MeshEnvelope::decode(&bytes),
            Err(WireError::NegativeLength(-1))
        );
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let body = SendMessageBody::broadcast(vec![0u8; MAX_ENVELOPE_LEN]);
        let env = MeshEnvelope::send_message(4, 1, PeerIdentity::random(), &body);
        assert!(matches!(env.encode(), Err(WireError::TooLarge(_))));
        assert!(matches!(
            MeshEnvelope::decode(&vec![0u8; MAX_ENVELOPE_LEN + 1]),
            Err(WireError::TooLarge(_))
        ));
    }

    #[test]
    fn test_peek_message_type() {
        let bytes = sample().encode().unwrap();
        assert_eq!(peek_message_type(&bytes).unwrap(), MessageType::SendMessage);

        let mut ack = bytes.clone();
        ack[0..4].copy_from_slice(&0i32.to_be_bytes());
        assert_eq!(peek_message_type(&ack).unwrap(), MessageType::Ack);
    }

    #[test]
    fn test_ack_body() {
        let body = AckMessageBody::new("ok");
        let bytes = body.encode();
        assert_eq!(bytes, vec![0, 0, 0, 2, b'o', b'k']);

        let env = MeshEnvelope::ack(0, 42, PeerIdentity::random(), &body);
        let decoded = MeshEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type, MessageType::Ack);
        assert_eq!(decoded.ack_body().unwrap(), body);

        assert_eq!(
            AckMessageBody::decode(&[0, 0, 0, 5, b'o']),
            Err(WireError::Truncated {
                expected: 9,
                actual: 5
            })
        );
        assert_eq!(
            AckMessageBody::decode(&(-2i32).to_be_bytes()),
            Err(WireError::NegativeLength(-2))
        );
        assert_eq!(
            AckMessageBody::decode(&[0, 0, 0, 1, 0xff]),
            Err(WireError::InvalidText)
        );
    }

    #[test]
    fn test_nil_destination_decodes_as_none() {
        let body = SendMessageBody::broadcast(b"all".to_vec());
        let bytes = body.encode();
        assert!(bytes[5..21].iter().all(|b| *b == 0));
        let decoded = SendMessageBody::decode(&bytes).unwrap();
        assert_eq!(decoded.destination, None);
        assert!(decoded.is_broadcast);
    }
}
