//! Pluggable wire codec for [`Message`] (§6: "exact byte layout is delegated
//! to a pluggable codec").

use super::Message;
use anyhow::Result;

/// Encodes/decodes a [`Message`] to/from a byte buffer. Implementations must
/// round-trip every header field unchanged, per §6.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// The default codec: compact binary encoding via `bincode`, matching the
/// teacher's own choice for `Message::to_bytes`/`from_bytes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(bincode::serialize(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EndpointId, MessageId, Priority};

    #[test]
    fn round_trips_every_header_field_except_the_ones_meant_to_change() {
        let mut message = Message::new(
            MessageId::new("eagiTest", "ping"),
            EndpointId(7),
            EndpointId(9),
            Priority::High,
            vec![1, 2, 3, 4],
        );
        message.sequence_no = 42;
        message.hop_count = 3;
        message.age_quarter_seconds = 11;
        message.serializer_id = 2;
        message.crypto_flags.signed = true;

        let codec = BincodeCodec;
        let bytes = codec.encode(&message).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.message_id, message.message_id);
        assert_eq!(decoded.source_id, message.source_id);
        assert_eq!(decoded.target_id, message.target_id);
        assert_eq!(decoded.sequence_no, message.sequence_no);
        assert_eq!(decoded.priority, message.priority);
        assert_eq!(decoded.hop_count, message.hop_count);
        assert_eq!(decoded.age_quarter_seconds, message.age_quarter_seconds);
        assert_eq!(decoded.serializer_id, message.serializer_id);
        assert_eq!(decoded.crypto_flags, message.crypto_flags);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn decode_error_on_garbage() {
        let codec = BincodeCodec;
        assert!(codec.decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
