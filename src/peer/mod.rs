//! Peer connection state machine: the leecher side of the peer wire
//! protocol, driving a single TCP connection against the shared piece
//! manager.

pub mod connection;

pub use connection::{PeerConnection, PeerState};

use thiserror::Error;

use crate::piece::PieceError;
use crate::wire::WireError;

pub type PeerId = [u8; 20];

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("I/O error talking to peer: {0}")]
    Io(#[from] std::io::Error),

    /// A failed write to the output file. Unlike a hash mismatch (handled
    /// internally by the piece manager, non-fatal), this can never be
    /// recovered by re-requesting the block, so it must abort the whole
    /// session rather than just this one peer connection.
    #[error("fatal piece storage error: {0}")]
    Fatal(#[from] PieceError),
}

pub type PeerResult<T> = Result<T, PeerError>;
