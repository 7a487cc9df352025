//! Torrent metainfo parsing and error handling.
//!
//! This module provides types and error handling for working with .torrent
//! files, including parsing, validation, and info-hash computation.
use thiserror::Error;

pub mod metainfo;

pub use metainfo::Metainfo;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed metainfo: {0}")]
    Malformed(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("torrent has a 'files' list; multi-file torrents are not supported")]
    UnsupportedTorrent,

    #[error("invalid pieces hash length (not a multiple of 20)")]
    InvalidPiecesHashLength,
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;
