//! # Peer Handshake
//!
//! The handshake is the fixed 68-byte record exchanged on every new peer
//! connection, before any framed message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, always 19
//! - **pstr**: the 19-byte literal "BitTorrent protocol"
//! - **reserved**: 8 bytes of capability flags
//! - **info_hash**: 20-byte SHA-1 of the torrent info dictionary
//! - **peer_id**: 20-byte identifier of the sending client
//!
//! The info hash is what ties a connection to a swarm; callers compare it
//! against the expected value and drop the connection on mismatch. The peer
//! id is accepted as-is.
//!
//! This client sets bit 20 of the reserved field (byte 5 = `0x10`) to
//! advertise support for the extension protocol (BEP 10). Reserved bytes of
//! incoming handshakes are not validated.

use anyhow::{anyhow, Result};

use std::io::Read;

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Total size of a serialized handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

// Byte 5 of the reserved field, flags extension protocol support.
const RESERVED_EXTENSION_BYTE: usize = 5;
const RESERVED_EXTENSION_BIT: u8 = 0x10;

/// A decoded handshake record.
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the remote client
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a handshake for this session.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    /// * `peer_id` - 20-byte identifier of this client.
    ///
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        // Add pstrlen and pstr
        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID.as_bytes());

        // Add reserved bytes, advertising extension protocol support
        let mut reserved = [0u8; 8];
        reserved[RESERVED_EXTENSION_BYTE] = RESERVED_EXTENSION_BIT;
        serialized.extend_from_slice(&reserved);

        // Add info hash and peer id
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Read and validate a handshake from a stream.
///
/// Reads exactly 68 bytes. Fails if the protocol string length is not 19 or
/// the protocol string itself does not match. Reserved bytes are ignored.
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf)?;

    // Check protocol string length
    if buf[0] as usize != PROTOCOL_ID.len() {
        return Err(anyhow!(
            "invalid protocol string length: expected {}, got {}",
            PROTOCOL_ID.len(),
            buf[0]
        ));
    }

    // Check protocol string
    if &buf[1..20] != PROTOCOL_ID.as_bytes() {
        return Err(anyhow!("invalid protocol string in handshake"));
    }

    Ok(Handshake {
        info_hash: buf[28..48].to_vec(),
        peer_id: buf[48..68].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn serialize_layout() {
        let handshake = Handshake::new(vec![0xAA; 20], vec![0xBB; 20]);
        let serialized = handshake.serialize();

        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        // pstrlen + "BitTorrent protocol"
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        // Reserved bytes with the extension bit set
        assert_eq!(&serialized[20..28], &[0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert_eq!(&serialized[28..48], &[0xAA; 20]);
        assert_eq!(&serialized[48..68], &[0xBB; 20]);
    }

    #[test]
    fn read_round_trips() {
        let handshake = Handshake::new(vec![0x01; 20], vec![0x02; 20]);
        let serialized = handshake.serialize();

        let decoded = read_handshake(&mut Cursor::new(serialized)).unwrap();
        assert_eq!(decoded.info_hash, vec![0x01; 20]);
        assert_eq!(decoded.peer_id, vec![0x02; 20]);
    }

    #[test]
    fn read_rejects_bad_pstrlen() {
        let mut serialized = Handshake::new(vec![0x01; 20], vec![0x02; 20]).serialize();
        serialized[0] = 18;

        assert!(read_handshake(&mut Cursor::new(serialized)).is_err());
    }

    #[test]
    fn read_rejects_wrong_protocol_string() {
        let mut serialized = Handshake::new(vec![0x01; 20], vec![0x02; 20]).serialize();
        serialized[1] = b'X';

        assert!(read_handshake(&mut Cursor::new(serialized)).is_err());
    }

    #[test]
    fn read_rejects_truncated_stream() {
        let serialized = Handshake::new(vec![0x01; 20], vec![0x02; 20]).serialize();
        assert!(read_handshake(&mut Cursor::new(&serialized[..40])).is_err());
    }
}
