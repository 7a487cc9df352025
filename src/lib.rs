//! A single-file BitTorrent leeching client core: parses a `.torrent`,
//! announces to its tracker, and drives a bounded pool of peer
//! connections to download every piece to disk.
//!
//! This crate only leeches; it never serves data to other peers, runs a
//! DHT node, or seeds after completion.

pub mod bencode;
pub mod client;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use client::{Client, ClientConfig, ClientError};
pub use torrent::{Metainfo, MetainfoError};
