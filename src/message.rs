//! # Peer Wire Messages
//!
//! Framing and parsing for the BitTorrent peer wire protocol. After the
//! handshake, every message on the wire has the same shape:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32), counts the ID byte plus payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes, message-specific
//!
//! A length prefix of zero is a keep-alive: no ID, no payload. Peers send it
//! periodically so idle connections are not dropped.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | empty |
//! | 1 | UNCHOKE | empty |
//! | 2 | INTERESTED | empty |
//! | 3 | NOT INTERESTED | empty |
//! | 4 | HAVE | piece index (u32) |
//! | 5 | BITFIELD | raw bitfield bytes |
//! | 6 | REQUEST | index, begin, length (u32 each) |
//! | 7 | PIECE | index, begin, block bytes |
//! | 8 | CANCEL | index, begin, length (u32 each) |
//! | 9 | PORT | DHT listen port (u16) |
//! | 20 | EXTENDED | sub-ID byte + bencoded dictionary |

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::io::{Cursor, Read};

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
#[allow(dead_code)]
pub const MESSAGE_PORT: MessageId = 9;
pub const MESSAGE_EXTENDED: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

// Sub-ID of the extended handshake within MESSAGE_EXTENDED.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message into its on-wire form.
    ///
    /// Keep-alive messages serialize to a bare zero length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.id == MESSAGE_KEEPALIVE {
            return Ok(vec![0; 4]);
        }

        // Get message length
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = vec![];

        // Add message length
        serialized.write_u32::<BigEndian>(message_len as u32)?;

        // Add message id
        serialized.push(self.id);

        // Add message payload
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Read one framed message from a stream.
///
/// Blocks until a full frame is available. A zero length prefix decodes to
/// the keep-alive marker. I/O errors (including read timeouts configured on
/// the stream) are propagated to the caller unchanged.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    // Read the 4-byte length prefix
    let message_len = reader.read_u32::<BigEndian>()? as usize;

    // A length of 0 is a keep-alive
    if message_len == 0 {
        return Ok(Message::new(MESSAGE_KEEPALIVE));
    }

    // Read message id and payload
    let mut message_buf: Vec<u8> = vec![0; message_len];
    reader.read_exact(&mut message_buf)?;

    Ok(Message::new_with_payload(
        message_buf[0],
        message_buf[1..].to_vec(),
    ))
}

/// Build a REQUEST message for a block.
///
/// # Arguments
///
/// * `index` - Zero-based piece index.
/// * `begin` - Zero-based byte offset within the piece.
/// * `length` - Number of bytes requested.
///
pub fn format_request(index: u32, begin: u32, length: u32) -> Result<Message> {
    let mut payload: Vec<u8> = vec![];
    payload.write_u32::<BigEndian>(index)?;
    payload.write_u32::<BigEndian>(begin)?;
    payload.write_u32::<BigEndian>(length)?;

    Ok(Message::new_with_payload(MESSAGE_REQUEST, payload))
}

/// Build a HAVE message for a piece.
pub fn format_have(index: u32) -> Result<Message> {
    let mut payload: Vec<u8> = vec![];
    payload.write_u32::<BigEndian>(index)?;

    Ok(Message::new_with_payload(MESSAGE_HAVE, payload))
}

/// Parse a HAVE message and return the announced piece index.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE {
        return Err(anyhow!(
            "expected HAVE (id {}), got id {}",
            MESSAGE_HAVE,
            message.id
        ));
    }
    if message.payload.len() != 4 {
        return Err(anyhow!(
            "expected payload length 4, got length {}",
            message.payload.len()
        ));
    }

    let mut payload_cursor = Cursor::new(&message.payload);
    let index = payload_cursor.read_u32::<BigEndian>()?;

    Ok(index)
}

/// Parse a PIECE message and copy its block into a piece buffer.
///
/// Validates that the message carries the expected piece index and that the
/// block fits inside `buf`, then copies the block to `buf[begin..]`.
///
/// # Arguments
///
/// * `index` - Piece index the caller is downloading.
/// * `buf` - Destination buffer sized to the whole piece.
/// * `message` - The PIECE message received from the peer.
///
/// # Returns
///
/// The number of block bytes copied into `buf`.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!(
            "expected PIECE (id {}), got id {}",
            MESSAGE_PIECE,
            message.id
        ));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!("payload too short: {} < 8", message.payload.len()));
    }

    // Get piece index
    let mut payload_cursor = Cursor::new(&message.payload[0..8]);
    let parsed_index = payload_cursor.read_u32::<BigEndian>()?;
    if parsed_index != index {
        return Err(anyhow!("expected index {}, got {}", index, parsed_index));
    }

    // Get byte offset within piece
    let begin = payload_cursor.read_u32::<BigEndian>()? as usize;
    if begin >= buf.len() {
        return Err(anyhow!("begin offset too high: {} >= {}", begin, buf.len()));
    }

    // Get piece block
    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(anyhow!(
            "block too long: {} bytes at offset {} for buffer of {}",
            block.len(),
            begin,
            buf.len()
        ));
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len())
}

/// Extended handshake dictionary (BEP 10).
///
/// Only the fields this client cares about are modeled. Unknown keys in the
/// incoming dictionary are ignored during decoding.
#[derive(Default, Debug, Deserialize, Serialize)]
pub struct ExtendedHandshake {
    /// Maps extension names to the message IDs the peer assigned them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<HashMap<String, i64>>,
    /// Size of the info dictionary, advertised by ut_metadata peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
}

/// Build the extended handshake this client sends after INTERESTED.
///
/// Advertises ut_metadata support with the dictionary
/// `{"m": {"ut_metadata": 1}}`. The peer's answer is informational only.
pub fn format_extended_handshake() -> Result<Message> {
    let mut m = HashMap::new();
    m.insert("ut_metadata".to_string(), 1);

    let dict = ExtendedHandshake {
        m: Some(m),
        metadata_size: None,
    };

    // Payload is the sub-ID byte followed by the bencoded dictionary
    let mut payload: Vec<u8> = vec![EXTENDED_HANDSHAKE_ID];
    payload.extend(serde_bencode::ser::to_bytes(&dict)?);

    Ok(Message::new_with_payload(MESSAGE_EXTENDED, payload))
}

/// Decode a peer's extended handshake dictionary.
///
/// # Arguments
///
/// * `payload` - The bencoded dictionary, without the leading sub-ID byte.
///
pub fn parse_extended_handshake(payload: &[u8]) -> Result<ExtendedHandshake> {
    let handshake: ExtendedHandshake = serde_bencode::de::from_bytes(payload)?;

    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request_is_byte_exact() {
        let message = format_request(37, 0, 16384).unwrap();
        let serialized = message.serialize().unwrap();

        let expected = [
            0x00, 0x00, 0x00, 0x0D, // length = 13
            0x06, // id = REQUEST
            0x00, 0x00, 0x00, 0x25, // index = 37
            0x00, 0x00, 0x00, 0x00, // begin = 0
            0x00, 0x00, 0x40, 0x00, // length = 16384
        ];
        assert_eq!(serialized, expected);
    }

    #[test]
    fn read_message_round_trips() {
        let message = format_request(37, 0, 16384).unwrap();
        let serialized = message.serialize().unwrap();

        let parsed = read_message(&mut Cursor::new(serialized)).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn read_message_decodes_keep_alive() {
        let parsed = read_message(&mut Cursor::new(vec![0, 0, 0, 0])).unwrap();
        assert_eq!(parsed.id, MESSAGE_KEEPALIVE);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn keep_alive_serializes_to_zero_length_frame() {
        let message = Message::new(MESSAGE_KEEPALIVE);
        assert_eq!(message.serialize().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn parse_have_returns_index() {
        let message = format_have(4).unwrap();
        assert_eq!(parse_have(&message).unwrap(), 4);
    }

    #[test]
    fn parse_have_rejects_short_payload() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0]);
        assert!(parse_have(&message).is_err());
    }

    #[test]
    fn parse_piece_copies_block() {
        let mut buf = vec![0; 10];
        let message =
            Message::new_with_payload(MESSAGE_PIECE, vec![0, 0, 0, 4, 0, 0, 0, 2, 0xAA, 0xBB]);

        let n = parse_piece(4, &mut buf, &message).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, vec![0, 0, 0xAA, 0xBB, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn parse_piece_rejects_empty_payload() {
        let mut buf = vec![0; 10];
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![]);
        let err = parse_piece(4, &mut buf, &message).unwrap_err();
        assert!(err.to_string().contains("payload too short"));
    }

    #[test]
    fn parse_piece_rejects_wrong_index() {
        let mut buf = vec![0; 10];
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0, 0, 0, 5, 0, 0, 0, 0, 0xAA]);
        let err = parse_piece(4, &mut buf, &message).unwrap_err();
        assert_eq!(err.to_string(), "expected index 4, got 5");
    }

    #[test]
    fn parse_piece_rejects_begin_past_buffer() {
        let mut buf = vec![0; 10];
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0, 0, 0, 4, 0, 0, 0, 10, 0xAA]);
        let err = parse_piece(4, &mut buf, &message).unwrap_err();
        assert!(err.to_string().contains("begin offset too high"));
    }

    #[test]
    fn parse_piece_rejects_overlong_block() {
        let mut buf = vec![0; 10];
        let message = Message::new_with_payload(
            MESSAGE_PIECE,
            vec![0, 0, 0, 4, 0, 0, 0, 8, 0xAA, 0xBB, 0xCC],
        );
        let err = parse_piece(4, &mut buf, &message).unwrap_err();
        assert!(err.to_string().contains("block too long"));
    }

    #[test]
    fn parse_piece_rejects_wrong_id() {
        let mut buf = vec![0; 10];
        let message = format_have(4).unwrap();
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn extended_handshake_round_trips() {
        let message = format_extended_handshake().unwrap();
        assert_eq!(message.id, MESSAGE_EXTENDED);
        assert_eq!(message.payload[0], EXTENDED_HANDSHAKE_ID);

        let decoded = parse_extended_handshake(&message.payload[1..]).unwrap();
        let m = decoded.m.unwrap();
        assert_eq!(m.get("ut_metadata"), Some(&1));
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn extended_handshake_tolerates_unknown_keys() {
        let payload =
            b"d1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei31235e1:v14:SomeClient 1.0e";
        let decoded = parse_extended_handshake(payload).unwrap();
        assert_eq!(decoded.m.unwrap().get("ut_metadata"), Some(&3));
        assert_eq!(decoded.metadata_size, Some(31235));
    }
}
