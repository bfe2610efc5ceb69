//! # Marmot
//!
//! A minimal BitTorrent client library.
//!
//! Marmot speaks the v1 peer wire protocol: it parses metainfo files,
//! announces to HTTP trackers, and downloads content from a swarm with one
//! worker thread per peer, verifying every piece against its SHA-1 hash
//! before assembly.
//!
//! ## Architecture
//!
//! - [`torrent`]: metainfo parsing, tracker announces, and the swarm
//!   dispatcher that feeds workers and assembles the result
//! - [`worker`]: per-peer download loop with pipelined block requests
//! - [`client`]: one peer connection, from dial and handshake to the
//!   send/receive session operations
//! - [`message`] and [`handshake`]: the wire codec
//! - [`bitfield`], [`peer`], [`piece`]: the supporting data types

#[macro_use]
extern crate log;

pub mod bitfield;
pub mod client;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod worker;
