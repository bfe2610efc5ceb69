//! # Peer Endpoints
//!
//! Peers are discovered through tracker announces. The tracker's compact
//! response packs each peer into 6 bytes:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! both in network byte order. This module decodes that list into `Peer`
//! endpoints the swarm can dial.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

const COMPACT_PEER_SIZE: usize = 6;

type PeerId = u32;

/// A dialable peer endpoint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Sequential identifier used for logging
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// TCP port of the peer
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: Ipv4Addr, port: u16) -> Peer {
        Peer { id, ip, port }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode a compact peer list from a tracker response.
///
/// # Arguments
///
/// * `compact` - Concatenated 6-byte peer records.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6.
pub fn build_peers(compact: &[u8]) -> Result<Vec<Peer>> {
    if !compact.len().is_multiple_of(COMPACT_PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let nb_peers = compact.len() / COMPACT_PEER_SIZE;
    let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let offset = i * COMPACT_PEER_SIZE;

        // Read peer IP address
        let ip = Ipv4Addr::new(
            compact[offset],
            compact[offset + 1],
            compact[offset + 2],
            compact[offset + 3],
        );

        // Read peer port
        let mut port_cursor = Cursor::new(&compact[offset + 4..offset + 6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer::new(i as u32, ip, port));
    }

    Ok(peers)
}
