//! # Peer Worker
//!
//! One worker drives one peer for the whole download. Workers share a work
//! queue of pieces and a results channel, so a piece that fails on one peer
//! is simply put back for another to pick up.
//!
//! ## Lifecycle
//!
//! 1. **Session**: dial, handshake, INTERESTED and extended handshake are
//!    handled by [`Client::new`]. A peer that cannot be opened is abandoned
//!    and its worker exits; queued pieces stay available to the others.
//! 2. **Readiness**: frames are consumed until the peer unchokes us, with
//!    BITFIELD and HAVE frames recording which pieces it holds.
//! 3. **Work loop**: take a piece from the queue, skip it (requeue) if the
//!    peer does not have it, otherwise download, verify against the SHA-1
//!    hash, announce HAVE and publish the result.
//!
//! ## Pipelining
//!
//! A piece is fetched in blocks of up to 16 KiB with at most five requests
//! in flight. Blocks may come back out of order; each PIECE frame carries
//! its own offset and is copied straight into the piece buffer.
//!
//! ## Failure Handling
//!
//! - Transport errors mid-piece requeue the piece and terminate the worker.
//! - An integrity failure only requeues the piece; the session survives, as
//!   the bad buffer may stem from a choke transition rather than malice.

use crate::client::Client;
use crate::message::*;
use crate::peer::Peer;
use crate::piece::{PieceProgress, PieceResult, PieceWork};

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{Receiver, Sender};

use std::io;

// Maximum number of outstanding block requests per session
const MAX_BACKLOG: u32 = 5;

// Size of a block request (16KB)
const MAX_BLOCK_SIZE: u32 = 16384;

/// Downloads pieces from a single peer.
pub struct Worker {
    /// Endpoint of the remote peer
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent info dictionary
    info_hash: Vec<u8>,
    /// Number of pieces in the torrent, sizes the session bitfield
    nb_pieces: usize,
    /// Shared piece queue; the sender side is used to requeue failures
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Channel carrying verified pieces to the assembler
    result_tx: Sender<PieceResult>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        nb_pieces: usize,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_tx: Sender<PieceResult>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            nb_pieces,
            work_chan,
            result_tx,
        }
    }

    /// Run the worker until the peer fails or the work queue closes.
    pub fn start_download(&self) {
        // Open the peer session
        let mut client = match Client::new(
            self.peer.clone(),
            self.peer_id.clone(),
            self.info_hash.clone(),
        ) {
            Ok(client) => client,
            Err(e) => {
                warn!("Abandoning peer {}: {}", self.peer, e);
                return;
            }
        };

        // The initial bitfield read is best-effort; start over from a zeroed
        // bitfield and learn availability from the frames read below.
        let mut got_bitfield = false;
        client.reset_bitfield(self.nb_pieces);

        // Wait until the session becomes usable
        loop {
            let message = match client.read_message() {
                Ok(message) => message,
                Err(e) => {
                    warn!("Lost peer {} before unchoke: {}", self.peer, e);
                    return;
                }
            };

            match message.id {
                MESSAGE_UNCHOKE => {
                    client.read_unchoke();
                    break;
                }
                MESSAGE_BITFIELD => {
                    client.set_bitfield(message.payload);
                    got_bitfield = true;
                }
                MESSAGE_HAVE => {
                    if let Ok(index) = parse_have(&message) {
                        client.set_piece(index);
                        got_bitfield = true;
                    }
                }
                _ => {}
            }
        }

        loop {
            // Take a piece from the work queue
            let piece_work: PieceWork = match self.work_chan.1.recv() {
                Ok(piece_work) => piece_work,
                Err(_) => {
                    info!("Worker for peer {} exiting: work queue closed", self.peer);
                    return;
                }
            };

            // Skip pieces this peer does not have
            if got_bitfield && !client.has_piece(piece_work.index) {
                if self.work_chan.0.send(piece_work).is_err() {
                    return;
                }
                continue;
            }

            // Download; a transport failure costs this peer
            let data = match self.download_piece(&mut client, &piece_work) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "Download of piece {} from peer {} failed: {}",
                        piece_work.index, self.peer, e
                    );
                    if self.work_chan.0.send(piece_work).is_err() {
                        error!("Could not requeue piece");
                    }
                    return;
                }
            };

            // A hash mismatch only costs a retry; the session is kept
            if self.verify_piece_integrity(&piece_work, &data).is_err() {
                warn!(
                    "Piece {} from peer {} failed integrity check",
                    piece_work.index, self.peer
                );
                if self.work_chan.0.send(piece_work).is_err() {
                    error!("Could not requeue piece");
                    return;
                }
                continue;
            }

            info!(
                "Successfully downloaded piece {} from peer {}",
                piece_work.index, self.peer
            );

            // Announce the piece; failure here is not worth losing the peer
            if client.send_have(piece_work.index).is_err() {
                debug!("Could not send MESSAGE_HAVE to peer {}", self.peer);
            }

            // Publish the verified piece
            let piece_result = PieceResult::new(piece_work.index, piece_work.length, data);
            if self.result_tx.send(piece_result).is_err() {
                return;
            }
        }
    }

    /// Download one piece over the session, returning its full buffer.
    ///
    /// Pipelines block requests up to `MAX_BACKLOG` while unchoked and
    /// consumes frames until the piece is complete. Read timeouts are
    /// swallowed; all other I/O and parse failures abort the attempt.
    fn download_piece(&self, client: &mut Client, piece_work: &PieceWork) -> Result<Vec<u8>> {
        // The handshake deadline must not kill a long download
        client.clear_connection_timeout()?;

        let mut progress = PieceProgress::new(piece_work);

        while progress.downloaded < piece_work.length {
            // Top up the request pipeline
            if !client.is_choked() {
                while progress.backlog < MAX_BACKLOG && progress.requested < piece_work.length {
                    let mut block_size = MAX_BLOCK_SIZE;
                    let remaining = piece_work.length - progress.requested;
                    if remaining < MAX_BLOCK_SIZE {
                        block_size = remaining;
                    }

                    client.send_request(piece_work.index, progress.requested, block_size)?;
                    progress.backlog += 1;
                    progress.requested += block_size;
                }
            }

            // Read one frame
            let message = match client.read_message() {
                Ok(message) => message,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e),
            };

            match message.id {
                MESSAGE_CHOKE => client.read_choke(),
                MESSAGE_UNCHOKE => client.read_unchoke(),
                MESSAGE_HAVE => {
                    let index = parse_have(&message)?;
                    client.set_piece(index);
                }
                MESSAGE_PIECE => {
                    let n = parse_piece(piece_work.index, &mut progress.data, &message)?;
                    progress.downloaded += n as u32;
                    progress.backlog = progress.backlog.saturating_sub(1);
                }
                MESSAGE_EXTENDED => self.read_extended(client, &message),
                MESSAGE_KEEPALIVE => {
                    debug!("Receive keep-alive from peer {}", client.peer());
                }
                _ => {
                    debug!(
                        "Ignore message id {} from peer {}",
                        message.id,
                        client.peer()
                    );
                }
            }
        }

        Ok(progress.data)
    }

    /// Log a peer's extended handshake, if that is what the frame carries.
    ///
    /// Nothing in the download path depends on it, so decode failures and
    /// other sub-IDs are ignored.
    fn read_extended(&self, client: &Client, message: &Message) {
        match message.payload.first() {
            Some(&EXTENDED_HANDSHAKE_ID) => {
                match parse_extended_handshake(&message.payload[1..]) {
                    Ok(handshake) => {
                        info!(
                            "Extended handshake from peer {}: {:?}",
                            client.peer(),
                            handshake
                        );
                    }
                    Err(e) => {
                        debug!(
                            "Could not parse extended handshake from peer {}: {}",
                            client.peer(),
                            e
                        );
                    }
                }
            }
            _ => {
                debug!("Ignore extended message from peer {}", client.peer());
            }
        }
    }

    /// Check a downloaded piece against its expected SHA-1 hash.
    fn verify_piece_integrity(&self, piece_work: &PieceWork, data: &[u8]) -> Result<()> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash = hasher.finish().to_vec();

        if hash != piece_work.hash {
            return Err(anyhow!(
                "piece {} failed integrity check",
                piece_work.index
            ));
        }

        Ok(())
    }
}

/// Whether an error is a read deadline expiry rather than a real failure.
fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            )
        })
}
