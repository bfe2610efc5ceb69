//! # Torrent Sessions
//!
//! This module ties the client together: it parses the metainfo file,
//! discovers peers through the HTTP tracker(s), and coordinates the swarm
//! download from piece distribution to final assembly.
//!
//! ## Metainfo
//!
//! Torrent files are bencoded dictionaries:
//!
//! - **announce** / **announce-list**: tracker URL, or tiers of them (BEP 12)
//! - **info**: file name, total length, piece length, and the concatenated
//!   20-byte SHA-1 hashes of every piece
//!
//! The info hash identifying the content is the SHA-1 of the re-bencoded
//! info dictionary.
//!
//! ## Download Coordination
//!
//! The download uses one thread per peer and two channels:
//!
//! - a **work queue** holding one [`PieceWork`] per piece, with capacity for
//!   all of them so the initial fill and any requeue never block
//! - an unbuffered **results channel** handing verified pieces to the
//!   assembler
//!
//! Workers take pieces FIFO, requeue what they cannot finish, and the
//! assembler on the calling thread copies each result into place until all
//! pieces have landed. Pieces may complete in any order; the output buffer
//! reassembles them by index.

use crate::peer::{build_peers, Peer};
use crate::piece::{PieceResult, PieceWork};
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

// Port advertised to trackers
const PORT: u16 = 6881;
// Size of a SHA-1 digest in bytes
const SHA1_HASH_SIZE: usize = 20;
// HTTP timeout for tracker announces
const TRACKER_TIMEOUT_SECS: u64 = 15;

/// A torrent descriptor plus everything needed to download it.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 hash per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from the torrent metadata
    name: String,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// Peers available for downloading
    peers: Vec<Peer>,
}

/// Info dictionary of a metainfo file.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

/// Top-level structure of a metainfo file.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: BencodeInfo,
}

/// Tracker announce response.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Seconds until the peer list should be refreshed
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to identify the content.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish().to_vec())
    }

    /// Split the concatenated piece hashes into one digest per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let pieces = &self.pieces;
        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has a malformed pieces field"));
        }

        Ok(pieces
            .chunks(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

impl Torrent {
    /// Build a new, empty torrent.
    pub fn new() -> Self {
        Default::default()
    }

    /// Build a torrent from an already-assembled descriptor.
    ///
    /// This is the entry point for callers that discovered the metadata and
    /// the peers themselves and only want the swarm download.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        info_hash: Vec<u8>,
        peer_id: Vec<u8>,
        pieces_hashes: Vec<Vec<u8>>,
        piece_length: u32,
        length: u32,
        name: String,
        peers: Vec<Peer>,
    ) -> Torrent {
        Torrent {
            tiers: vec![],
            info_hash,
            pieces_hashes,
            piece_length,
            length,
            name,
            peer_id,
            peers,
        }
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a metainfo file and announce to its trackers.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent file.
    ///
    pub fn open(&mut self, filepath: PathBuf) -> Result<()> {
        // Read the metainfo file
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };
        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        self.parse_metainfo(&buf)?;

        // Discover peers
        let peer_id = self.peer_id.clone();
        self.peers = self.request_peers(&peer_id, PORT)?;

        Ok(())
    }

    /// Decode metainfo bytes and fill in the descriptor.
    fn parse_metainfo(&mut self, buf: &[u8]) -> Result<()> {
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        // Generate a random 20-byte peer id for this session
        let mut peer_id: Vec<u8> = vec![0; 20];
        let mut rng = rand::thread_rng();
        for x in peer_id.iter_mut() {
            *x = rng.gen();
        }

        if !bencode.announce_list.is_empty() {
            // Use announce-list, shuffling each tier as per BEP 12
            self.tiers = bencode.announce_list.clone();
            for tier in &mut self.tiers {
                tier.shuffle(&mut rng);
            }
        } else if !bencode.announce.is_empty() {
            self.tiers = vec![vec![bencode.announce.to_owned()]];
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        self.info_hash = bencode.info.hash()?;
        self.pieces_hashes = bencode.info.split_pieces_hashes()?;
        self.piece_length = bencode.info.piece_length;
        self.length = bencode.info.length;
        self.name = bencode.info.name.to_owned();
        self.peer_id = peer_id;

        Ok(())
    }

    /// Request peers from all known trackers.
    ///
    /// Every tracker across all tiers is announced to at once, so a dead
    /// tracker only costs its HTTP timeout. Each announce thread reports its
    /// compact peer list on a channel and the merge below keeps the first
    /// sighting of every endpoint.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte identifier sent to the trackers.
    /// * `port` - Port number this client claims to listen on.
    ///
    fn request_peers(&self, peer_id: &[u8], port: u16) -> Result<Vec<Peer>> {
        // One announce URL per distinct tracker
        let mut seen_trackers = HashSet::new();
        let mut announce_urls = Vec::new();
        for tracker in self.tiers.iter().flatten() {
            if !seen_trackers.insert(tracker.clone()) {
                continue;
            }
            match self.announce_url(tracker, peer_id, port) {
                Ok(url) => announce_urls.push(url),
                Err(e) => debug!("Skipping tracker {:?}: {}", tracker, e),
            }
        }
        if announce_urls.is_empty() {
            return Err(anyhow!("torrent has no usable tracker"));
        }

        let (peers_tx, peers_rx) = unbounded::<Vec<u8>>();

        for announce in announce_urls {
            let peers_tx = peers_tx.clone();
            thread::spawn(move || match announce_to_tracker(&announce) {
                Ok(compact) => {
                    let _ = peers_tx.send(compact);
                }
                Err(e) => debug!("Tracker {:?} gave no peers: {}", announce, e),
            });
        }

        // Once the announce threads are done the channel disconnects and the
        // merge loop below falls through
        drop(peers_tx);

        let mut peers: Vec<Peer> = Vec::new();
        let mut seen_endpoints = HashSet::new();
        for compact in peers_rx.iter() {
            let decoded = match build_peers(&compact) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            };
            for peer in decoded {
                if seen_endpoints.insert((peer.ip, peer.port)) {
                    peers.push(Peer::new(peers.len() as u32, peer.ip, peer.port));
                }
            }
        }

        if peers.is_empty() {
            return Err(anyhow!("no tracker returned any peer"));
        }

        Ok(peers)
    }

    /// Build the announce URL for one tracker.
    ///
    /// The textual parameters go through [`Url`]'s own query serializer.
    /// `info_hash` and `peer_id` are raw bytes that the serializer would
    /// mangle, so they are appended afterwards with their own escaping.
    fn announce_url(&self, announce: &str, peer_id: &[u8], port: u16) -> Result<String> {
        let mut url =
            Url::parse(announce).map_err(|_| anyhow!("tracker url {:?} is not valid", announce))?;

        url.query_pairs_mut()
            .append_pair("port", &port.to_string())
            .append_pair("uploaded", "0")
            .append_pair("downloaded", "0")
            .append_pair("left", &self.length.to_string())
            .append_pair("compact", "1")
            .append_pair("event", "started");

        let mut query = url.query().unwrap_or_default().to_string();
        query.push_str("&info_hash=");
        query.push_str(&escape_bytes(&self.info_hash));
        query.push_str("&peer_id=");
        query.push_str(&escape_bytes(peer_id));
        url.set_query(Some(&query));

        Ok(url.to_string())
    }

    /// Download the torrent and return the assembled content.
    ///
    /// Spawns one worker per peer, feeds the shared work queue with every
    /// piece in index order, and assembles verified pieces as they arrive.
    /// Fails if every peer is lost while pieces remain.
    pub fn download(&self) -> Result<Vec<u8>> {
        let nb_pieces = self.pieces_hashes.len();

        println!("Downloading {:?} ({} pieces)", self.name, nb_pieces);

        // Work queue sized so the initial fill and requeues never block
        let work_chan: (Sender<PieceWork>, Receiver<PieceWork>) = bounded(nb_pieces);

        // Rendezvous channel: pieces are handed straight to the assembler
        let (result_tx, result_rx): (Sender<PieceResult>, Receiver<PieceResult>) = bounded(0);

        // Seed the queue with every piece, in index order
        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let piece_index = index as u32;
            let (begin, end) = self.piece_bounds(piece_index);
            let piece_work = PieceWork::new(piece_index, hash.clone(), end - begin);

            if work_chan.0.send(piece_work).is_err() {
                return Err(anyhow!("could not seed work queue"));
            }
        }

        // Start one worker per peer
        for peer in self.peers.to_owned() {
            let worker = Worker::new(
                peer,
                self.peer_id.clone(),
                self.info_hash.clone(),
                nb_pieces,
                work_chan.clone(),
                result_tx.clone(),
            );

            thread::spawn(move || {
                worker.start_download();
            });
        }

        // Only workers hold result senders from here on. If the last worker
        // dies with pieces still missing, the receive below disconnects
        // instead of blocking forever.
        drop(result_tx);

        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
                .progress_chars("#>-"),
        );

        // Assemble pieces as they arrive, in whatever order that is
        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut nb_pieces_downloaded = 0;
        while nb_pieces_downloaded < nb_pieces {
            let piece_result: PieceResult = match result_rx.recv() {
                Ok(piece_result) => piece_result,
                Err(_) => return Err(anyhow!("no peers left, download incomplete")),
            };

            let (begin, end) = self.piece_bounds(piece_result.index);
            data[begin as usize..end as usize].copy_from_slice(&piece_result.data);

            pb.inc(piece_result.length as u64);
            nb_pieces_downloaded += 1;

            info!(
                "Assembled piece {} ({}/{})",
                piece_result.index, nb_pieces_downloaded, nb_pieces
            );
        }

        pb.finish();

        Ok(data)
    }

    /// Byte range `[begin, end)` of a piece within the file.
    ///
    /// The last piece is usually shorter than `piece_length`; its end is
    /// clamped to the total length.
    fn piece_bounds(&self, index: u32) -> (u32, u32) {
        let begin = index * self.piece_length;
        let mut end = begin + self.piece_length;
        if end > self.length {
            end = self.length;
        }
        (begin, end)
    }
}

/// Announce to one tracker and return its compact peer list.
fn announce_to_tracker(announce: &str) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS))
        .build()?;

    let response = client.get(announce).send()?.bytes()?;
    let tracker: BencodeTracker = de::from_bytes(&response)?;

    Ok(tracker.peers.to_vec())
}

/// Percent-escape every byte, as trackers expect for binary query values.
fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("%{:02X}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(piece_length: u32, length: u32, nb_pieces: usize) -> Torrent {
        Torrent::from_parts(
            vec![0xAA; 20],
            vec![0xBB; 20],
            vec![vec![0; 20]; nb_pieces],
            piece_length,
            length,
            "test".to_string(),
            vec![],
        )
    }

    #[test]
    fn piece_bounds_clamp_the_last_piece() {
        let torrent = descriptor(32768, 81920, 3);

        assert_eq!(torrent.piece_bounds(0), (0, 32768));
        assert_eq!(torrent.piece_bounds(1), (32768, 65536));
        assert_eq!(torrent.piece_bounds(2), (65536, 81920));
    }

    #[test]
    fn piece_sizes_cover_the_whole_file() {
        let torrent = descriptor(32768, 81920, 3);

        let total: u32 = (0..3)
            .map(|index| {
                let (begin, end) = torrent.piece_bounds(index);
                end - begin
            })
            .sum();
        assert_eq!(total, 81920);
    }

    #[test]
    fn parse_metainfo_extracts_descriptor() {
        let bencode = BencodeTorrent {
            announce: "http://tracker.local/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![0x11; 40]),
                piece_length: 32768,
                length: 40000,
                name: "artifact.bin".to_string(),
            },
        };
        let buf = ser::to_bytes(&bencode).unwrap();

        let mut torrent = Torrent::new();
        torrent.parse_metainfo(&buf).unwrap();

        assert_eq!(torrent.name, "artifact.bin");
        assert_eq!(torrent.piece_length, 32768);
        assert_eq!(torrent.length, 40000);
        assert_eq!(torrent.pieces_hashes.len(), 2);
        assert_eq!(torrent.info_hash.len(), 20);
        assert_eq!(torrent.peer_id.len(), 20);
        assert_eq!(
            torrent.tiers,
            vec![vec!["http://tracker.local/announce".to_string()]]
        );
    }

    #[test]
    fn parse_metainfo_rejects_malformed_pieces() {
        let bencode = BencodeTorrent {
            announce: "http://tracker.local/announce".to_string(),
            announce_list: vec![],
            info: BencodeInfo {
                pieces: ByteBuf::from(vec![0x11; 30]),
                piece_length: 32768,
                length: 40000,
                name: "artifact.bin".to_string(),
            },
        };
        let buf = ser::to_bytes(&bencode).unwrap();

        let mut torrent = Torrent::new();
        assert!(torrent.parse_metainfo(&buf).is_err());
    }

    #[test]
    fn announce_url_percent_encodes_binary_fields() {
        let torrent = descriptor(32768, 81920, 3);
        let url = torrent
            .announce_url("http://tracker.local/announce", &[0xBB; 20], 6881)
            .unwrap();

        assert!(url.starts_with("http://tracker.local/announce?port=6881&"));
        assert!(url.contains("&left=81920&"));
        assert!(url.contains("&compact=1&"));
        assert!(url.contains(&format!("&info_hash={}", "%AA".repeat(20))));
        assert!(url.ends_with(&format!("&peer_id={}", "%BB".repeat(20))));
    }

    #[test]
    fn escape_bytes_covers_the_whole_range() {
        assert_eq!(escape_bytes(&[0x00, 0x1A, 0xFF]), "%00%1A%FF");
        assert_eq!(escape_bytes(&[]), "");
    }
}
