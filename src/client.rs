//! # Peer Connection
//!
//! One `Client` owns the connection to one remote peer and carries the
//! session state the download loop needs: the choke flag and the peer's
//! piece bitfield.
//!
//! ## Connection Sequence
//!
//! 1. **Dial**: plain TCP with an 8 second timeout. (Some swarms prefer uTP,
//!    but there is no maintained uTP implementation to build on, so TCP is
//!    the only transport.)
//! 2. **Handshake**: exchanged under a 30 second deadline, cleared once it
//!    succeeds. The peer's info hash must match ours byte for byte.
//! 3. **INTERESTED**: sent immediately, so the peer knows we want data.
//! 4. **Extended handshake**: advertises ut_metadata (BEP 10). The peer's
//!    reply is not required.
//! 5. **Initial bitfield**: one framed message read under a 60 second
//!    deadline. Most peers lead with BITFIELD; anything else (keep-alive,
//!    HAVE, EXTENDED, or a timeout) leaves the bitfield empty and the worker
//!    fills it in from later frames.
//!
//! ## Session State
//!
//! A new session starts choked. CHOKE and UNCHOKE frames flip the flag;
//! requests are only issued while unchoked.

use crate::bitfield::Bitfield;
use crate::handshake::{read_handshake, Handshake};
use crate::message::*;
use crate::peer::Peer;

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, WriteBytesExt};

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

// Connection timeouts, in seconds.
const DIAL_TIMEOUT_TCP: u64 = 8;
const HANDSHAKE_DEADLINE: u64 = 30;
const INITIAL_BITFIELD_DEADLINE: u64 = 60;

/// A live session with one remote peer.
pub struct Client {
    /// Endpoint of the remote peer
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent info dictionary
    info_hash: Vec<u8>,
    /// Transport connection to the peer
    conn: TcpStream,
    /// Pieces the peer claims to have
    bitfield: Bitfield,
    /// Whether the peer currently chokes this client
    choked: bool,
}

impl Client {
    /// Open a session with a peer.
    ///
    /// Dials the peer, performs the handshake, sends INTERESTED and the
    /// extended handshake, and tries to capture the peer's initial bitfield.
    /// Any failure up to and including the handshake abandons the peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Endpoint to dial.
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    ///
    pub fn new(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Result<Client> {
        // Dial peer
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn =
            match TcpStream::connect_timeout(&peer_socket, Duration::from_secs(DIAL_TIMEOUT_TCP)) {
                Ok(conn) => conn,
                Err(_) => return Err(anyhow!("could not dial peer {}", peer)),
            };

        info!("Connected to peer {}", peer);

        let mut client = Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
        };

        // Handshake under a deadline, cleared on success
        client.set_connection_timeout(HANDSHAKE_DEADLINE)?;
        client.handshake_with_peer()?;
        client.clear_connection_timeout()?;

        // Tell the peer we want data
        client.send_interested()?;

        // Advertise extension support
        client.send_extended_handshake()?;

        // Best-effort capture of the initial bitfield
        client.recv_initial_bitfield()?;

        Ok(client)
    }

    /// Exchange and validate the 68-byte handshake.
    fn handshake_with_peer(&mut self) -> Result<()> {
        // Send our handshake
        let handshake = Handshake::new(self.info_hash.clone(), self.peer_id.clone());
        self.conn
            .write_all(&handshake.serialize())
            .context("could not send handshake to peer")?;

        // Read and validate the peer's handshake
        let peer_handshake =
            read_handshake(&mut self.conn).context("could not read handshake from peer")?;

        // The peer id is accepted as-is, only the info hash matters
        if peer_handshake.info_hash != self.info_hash {
            return Err(anyhow!("handshake info hash mismatch"));
        }

        info!("Handshake completed with peer {}", self.peer);

        Ok(())
    }

    /// Send the extended handshake advertising ut_metadata.
    fn send_extended_handshake(&mut self) -> Result<()> {
        let message = format_extended_handshake()?;
        self.send_message(&message, "MESSAGE_EXTENDED")
    }

    /// Read one message hoping for the peer's initial BITFIELD.
    ///
    /// Runs under its own read deadline. A timeout, an early keep-alive,
    /// HAVE, or EXTENDED frame all leave the bitfield empty; the worker loop
    /// populates it from subsequent frames instead.
    fn recv_initial_bitfield(&mut self) -> Result<()> {
        self.conn
            .set_read_timeout(Some(Duration::from_secs(INITIAL_BITFIELD_DEADLINE)))?;

        match read_message(&mut self.conn) {
            Ok(message) if message.id == MESSAGE_BITFIELD => {
                info!("Receive MESSAGE_BITFIELD from peer {}", self.peer);
                self.bitfield = Bitfield::from_bytes(message.payload);
            }
            Ok(message) => {
                debug!(
                    "Receive message id {} instead of bitfield from peer {}",
                    message.id, self.peer
                );
            }
            Err(_) => {
                debug!("No initial bitfield from peer {}", self.peer);
            }
        }

        self.conn.set_read_timeout(None)?;

        Ok(())
    }

    /// Returns whether the peer currently chokes this client.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Process a CHOKE message from the peer.
    pub fn read_choke(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {}", self.peer);
        self.choked = true
    }

    /// Process an UNCHOKE message from the peer.
    pub fn read_unchoke(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
        self.choked = false
    }

    /// Check whether the peer has a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    /// Mark a piece as available on this peer.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set(index);
    }

    /// Replace the bitfield with the payload of a BITFIELD message.
    pub fn set_bitfield(&mut self, bytes: Vec<u8>) {
        self.bitfield = Bitfield::from_bytes(bytes);
    }

    /// Reset the bitfield to all-zero, sized for the torrent.
    pub fn reset_bitfield(&mut self, nb_pieces: usize) {
        self.bitfield = Bitfield::new(nb_pieces);
    }

    /// Set read and write timeouts on the connection.
    ///
    /// # Arguments
    ///
    /// * `secs` - Timeout in seconds, applied to both directions.
    ///
    pub fn set_connection_timeout(&self, secs: u64) -> Result<()> {
        self.conn
            .set_write_timeout(Some(Duration::from_secs(secs)))
            .context("could not set write timeout")?;
        self.conn
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .context("could not set read timeout")?;

        Ok(())
    }

    /// Clear both connection timeouts so reads can block indefinitely.
    pub fn clear_connection_timeout(&self) -> Result<()> {
        self.conn
            .set_write_timeout(None)
            .context("could not clear write timeout")?;
        self.conn
            .set_read_timeout(None)
            .context("could not clear read timeout")?;

        Ok(())
    }

    /// Read the next framed message from the peer.
    ///
    /// Blocks until a frame arrives. Keep-alives decode to the keep-alive
    /// marker. I/O errors, including timeouts when a read deadline is set,
    /// are returned to the caller.
    pub fn read_message(&mut self) -> Result<Message> {
        read_message(&mut self.conn)
    }

    fn send_message(&mut self, message: &Message, label: &str) -> Result<()> {
        let serialized = message.serialize()?;
        debug!("Send {} to peer {}", label, self.peer);

        self.conn
            .write_all(&serialized)
            .with_context(|| format!("could not send {} to peer", label))
    }

    /// Send an INTERESTED message.
    pub fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_INTERESTED), "MESSAGE_INTERESTED")
    }

    /// Send a NOT INTERESTED message.
    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<()> {
        self.send_message(
            &Message::new(MESSAGE_NOT_INTERESTED),
            "MESSAGE_NOT_INTERESTED",
        )
    }

    /// Send an UNCHOKE message.
    #[allow(dead_code)]
    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_UNCHOKE), "MESSAGE_UNCHOKE")
    }

    /// Send a HAVE message announcing a verified piece.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        let message = format_have(index)?;
        self.send_message(&message, "MESSAGE_HAVE")
    }

    /// Send a REQUEST message for a block.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Zero-based byte offset within the piece.
    /// * `length` - Number of bytes to request.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let message = format_request(index, begin, length)?;
        debug!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );

        let serialized = message.serialize()?;
        self.conn
            .write_all(&serialized)
            .context("could not send MESSAGE_REQUEST to peer")
    }

    /// Send a CANCEL message for a pending block request.
    #[allow(dead_code)]
    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = vec![];
        payload.write_u32::<BigEndian>(index)?;
        payload.write_u32::<BigEndian>(begin)?;
        payload.write_u32::<BigEndian>(length)?;

        let message = Message::new_with_payload(MESSAGE_CANCEL, payload);
        self.send_message(&message, "MESSAGE_CANCEL")
    }

    /// Peer this session is connected to, for logging.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}
