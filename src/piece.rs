//! # Piece Tracking
//!
//! Pieces are the verification units of a torrent. The swarm hands each one
//! around as a work item, downloads it in 16 KiB blocks, and verifies the
//! result against its SHA-1 hash before accepting it.
//!
//! - [`PieceWork`]: one piece waiting in the shared work queue
//! - [`PieceProgress`]: the in-flight state of one download attempt
//! - [`PieceResult`]: a verified piece on its way to the assembler

/// A piece waiting to be downloaded.
///
/// Created once per piece when the download starts and recirculated through
/// the work queue until some worker completes it.
#[derive(Default, Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece (20 bytes)
    pub hash: Vec<u8>,
    /// Length of the piece in bytes
    pub length: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

/// Download state for one attempt at one piece, owned by a single worker.
///
/// `downloaded <= requested <= length` holds throughout, and `backlog` counts
/// requests sent but not yet answered.
#[derive(Default, Debug)]
pub struct PieceProgress {
    /// Zero-based index of the piece being downloaded
    pub index: u32,
    /// Piece buffer the incoming blocks are copied into
    pub data: Vec<u8>,
    /// Bytes received and stored so far
    pub downloaded: u32,
    /// Bytes covered by requests sent so far
    pub requested: u32,
    /// Outstanding block requests
    pub backlog: u32,
}

impl PieceProgress {
    /// Start a fresh attempt for a work item, with a zeroed piece buffer.
    pub fn new(piece_work: &PieceWork) -> PieceProgress {
        PieceProgress {
            index: piece_work.index,
            data: vec![0; piece_work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

/// A fully downloaded and hash-verified piece.
#[derive(Default, Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes
    pub length: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

impl PieceResult {
    pub fn new(index: u32, length: u32, data: Vec<u8>) -> PieceResult {
        PieceResult {
            index,
            length,
            data,
        }
    }
}
