//! # Wire Encoding
//!
//! ## Purpose
//! Pure, allocation-minimal encode/decode of the fixed 16-byte nceph header
//! plus body. No I/O, no state; the incremental side lives in
//! [`crate::assembler`].
//!
//! ## Layout (big-endian)
//! ```text
//! offset  0  genesis      1 byte   sentinel 0x4E
//! offset  1  counter      1 byte   per-connection sequence
//! offset  2  flags        1 byte   bit 0 = trace
//! offset  3  type         1 byte   MessageType
//! offset  4  source_id    2 bytes
//! offset  6  message_id   6 bytes  48-bit unsigned
//! offset 12  data_length  4 bytes
//! offset 16  data         data_length bytes
//! ```

use crate::constants::{GENESIS, HEADER_SIZE, MAX_DATA_LENGTH};
use crate::error::{CodecError, CodecResult};
use crate::message::{Message, MessageId, MessageType};
use byteorder::{BigEndian, ByteOrder};

/// Decoded header fields, genesis validated and stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub counter: u8,
    pub flags: u8,
    pub message_type: MessageType,
    pub id: MessageId,
    pub data_length: u32,
}

/// Encode a message to its full wire representation.
///
/// Total for any [`Message`]: the constructor already enforced the 48-bit id
/// and body-length bounds.
pub fn encode(message: &Message) -> Vec<u8> {
    let data = message.data();
    let mut buf = vec![0u8; HEADER_SIZE + data.len()];
    buf[0] = GENESIS;
    buf[1] = message.counter();
    buf[2] = message.flags();
    buf[3] = message.message_type().into();
    BigEndian::write_u16(&mut buf[4..6], message.id().source_id);
    BigEndian::write_u48(&mut buf[6..12], message.id().message_id);
    BigEndian::write_u32(&mut buf[12..16], data.len() as u32);
    buf[HEADER_SIZE..].copy_from_slice(data);
    buf
}

/// Decode a full 16-byte header, genesis byte included.
///
/// Fails only on truncated input, a wrong sentinel, an unregistered message
/// type or a body length above the protocol maximum.
pub fn decode_header(buf: &[u8]) -> CodecResult<WireHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::HeaderTooSmall {
            need: HEADER_SIZE,
            got: buf.len(),
        });
    }
    if buf[0] != GENESIS {
        return Err(CodecError::InvalidGenesis {
            expected: GENESIS,
            actual: buf[0],
        });
    }
    let message_type = MessageType::try_from(buf[3])
        .map_err(|_| CodecError::UnknownMessageType { raw: buf[3] })?;
    let data_length = BigEndian::read_u32(&buf[12..16]);
    if data_length as usize > MAX_DATA_LENGTH {
        return Err(CodecError::DataTooLarge {
            length: data_length as usize,
            max: MAX_DATA_LENGTH,
        });
    }
    Ok(WireHeader {
        counter: buf[1],
        flags: buf[2],
        message_type,
        id: MessageId::new(
            BigEndian::read_u16(&buf[4..6]),
            BigEndian::read_u48(&buf[6..12]),
        ),
        data_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn sample() -> Message {
        Message::new(
            MessageType::PublishEvent,
            MessageId::new(0x0102, 0x030405060708),
            b"{\"k\":1}".to_vec(),
        )
        .unwrap()
        .with_counter(9)
        .with_trace()
    }

    #[test]
    fn encode_layout_is_fixed_and_big_endian() {
        let bytes = encode(&sample());
        assert_eq!(bytes[0], GENESIS);
        assert_eq!(bytes[1], 9); // counter
        assert_eq!(bytes[2], 1); // trace flag
        assert_eq!(bytes[3], u8::from(MessageType::PublishEvent));
        assert_eq!(&bytes[4..6], &[0x01, 0x02]);
        assert_eq!(&bytes[6..12], &[0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 7]);
        assert_eq!(bytes.len(), HEADER_SIZE + 7);
    }

    #[test]
    fn decode_inverts_encode() {
        let msg = sample();
        let bytes = encode(&msg);
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.counter, msg.counter());
        assert_eq!(header.flags, msg.flags());
        assert_eq!(header.message_type, msg.message_type());
        assert_eq!(header.id, msg.id());
        assert_eq!(header.data_length as usize, msg.data().len());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let bytes = encode(&sample());
        let result = decode_header(&bytes[..10]);
        assert!(matches!(result, Err(CodecError::HeaderTooSmall { got: 10, .. })));
    }

    #[test]
    fn wrong_genesis_is_rejected() {
        let mut bytes = encode(&sample());
        bytes[0] = 0xFF;
        assert!(matches!(
            decode_header(&bytes),
            Err(CodecError::InvalidGenesis { actual: 0xFF, .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = encode(&sample());
        bytes[3] = 0xEE;
        assert!(matches!(
            decode_header(&bytes),
            Err(CodecError::UnknownMessageType { raw: 0xEE })
        ));
    }
}
