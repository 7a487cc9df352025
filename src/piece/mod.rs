//! The piece manager: the global download plan. Owns which pieces exist,
//! which blocks within them are pending/received per peer, verifies
//! completed pieces against their SHA-1 digest, and flushes verified
//! pieces to the output file.
//!
//! The pending request ledger, a mapping from `(piece_index,
//! block_offset)` to `(peer_id, issued_at)`, is modeled here as the union
//! of every [`BlockState::Pending`] entry across all pieces rather than as
//! a separate map: sweeping it is "scan blocks, demote stale entries",
//! which is the whole of `sweep_stale_pending` below.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::torrent::Metainfo;
use crate::wire::Bitfield;

pub const BLOCK_SIZE: u32 = 16 * 1024;

pub type PeerId = [u8; 20];

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece {0} hash mismatch")]
    HashMismatch(usize),

    #[error("output file I/O error: {0}")]
    FileIo(#[from] std::io::Error),
}

pub type PieceResult<T> = Result<T, PieceError>;

#[derive(Debug, Clone)]
enum BlockState {
    Missing,
    Pending { peer_id: PeerId, issued_at: Instant },
    Retrieved(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Block {
    length: u32,
    state: BlockState,
}

#[derive(Debug)]
struct Piece {
    expected_hash: [u8; 20],
    blocks: Vec<Block>,
    complete: bool,
}

impl Piece {
    fn new(piece_length: u64, expected_hash: [u8; 20]) -> Self {
        let mut blocks = Vec::new();
        let mut remaining = piece_length;
        while remaining > 0 {
            let length = remaining.min(BLOCK_SIZE as u64) as u32;
            blocks.push(Block { length, state: BlockState::Missing });
            remaining -= length as u64;
        }
        Self { expected_hash, blocks, complete: false }
    }

    fn offset_of(&self, block_index: usize) -> u32 {
        self.blocks[..block_index].iter().map(|b| b.length).sum()
    }

    fn block_index_for_offset(&self, offset: u32) -> Option<usize> {
        let mut cursor = 0u32;
        for (i, block) in self.blocks.iter().enumerate() {
            if cursor == offset {
                return Some(i);
            }
            cursor += block.length;
        }
        None
    }

    fn all_retrieved(&self) -> bool {
        self.blocks.iter().all(|b| matches!(b.state, BlockState::Retrieved(_)))
    }

    fn concatenated(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.blocks.iter().map(|b| b.length as usize).sum());
        for block in &self.blocks {
            if let BlockState::Retrieved(data) = &block.state {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    fn reset_all_to_missing(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Missing;
        }
        self.complete = false;
    }
}

/// The global download plan shared by every peer connection.
pub struct PieceManager {
    pieces: Vec<Piece>,
    piece_length: u64,
    total_length: u64,
    peer_bitfields: HashMap<PeerId, Bitfield>,
    pending_timeout: Duration,
    output: File,
}

impl PieceManager {
    pub fn new(metainfo: &Metainfo, output_path: &Path, pending_timeout: Duration) -> PieceResult<Self> {
        let pieces = (0..metainfo.num_pieces())
            .map(|i| Piece::new(metainfo.piece_length_of(i), metainfo.pieces[i]))
            .collect();
        let output = File::options()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(output_path)?;
        output.set_len(metainfo.length)?;
        Ok(Self {
            pieces,
            piece_length: metainfo.piece_length,
            total_length: metainfo.length,
            peer_bitfields: HashMap::new(),
            pending_timeout,
            output,
        })
    }

    /// Registers (or replaces, idempotently) a peer's claimed bitfield.
    pub fn add_peer(&mut self, peer_id: PeerId, bitfield: Bitfield) {
        self.peer_bitfields.insert(peer_id, bitfield);
    }

    /// Sets bit `piece_index` in a peer's bitfield in response to `have`.
    pub fn update_peer(&mut self, peer_id: PeerId, piece_index: usize) {
        self.peer_bitfields
            .entry(peer_id)
            .or_insert_with(|| Bitfield::empty(self.pieces.len()))
            .set(piece_index);
    }

    /// Drops a peer and returns any blocks it held pending to `Missing`.
    pub fn remove_peer(&mut self, peer_id: PeerId) {
        self.peer_bitfields.remove(&peer_id);
        for piece in &mut self.pieces {
            for block in &mut piece.blocks {
                if let BlockState::Pending { peer_id: owner, .. } = &block.state {
                    if *owner == peer_id {
                        block.state = BlockState::Missing;
                    }
                }
            }
        }
    }

    fn sweep_stale_pending(&mut self) {
        let now = Instant::now();
        let timeout = self.pending_timeout;
        for piece in &mut self.pieces {
            for block in &mut piece.blocks {
                if let BlockState::Pending { issued_at, .. } = &block.state {
                    if now.duration_since(*issued_at) > timeout {
                        block.state = BlockState::Missing;
                    }
                }
            }
        }
    }

    /// Selects the next block request for `peer_id`: the lowest-offset
    /// Missing block of the lowest-indexed incomplete piece the peer
    /// claims to have. Sweeps stale pending entries first.
    #[instrument(skip(self), level = "debug")]
    pub fn next_request(&mut self, peer_id: PeerId) -> Option<(usize, u32, u32)> {
        self.sweep_stale_pending();
        let bitfield = self.peer_bitfields.get(&peer_id)?;
        for (piece_index, piece) in self.pieces.iter_mut().enumerate() {
            if piece.complete || !bitfield.has(piece_index) {
                continue;
            }
            if let Some(block_index) = piece
                .blocks
                .iter()
                .position(|b| matches!(b.state, BlockState::Missing))
            {
                let offset = piece.offset_of(block_index);
                let length = piece.blocks[block_index].length;
                piece.blocks[block_index].state =
                    BlockState::Pending { peer_id, issued_at: Instant::now() };
                return Some((piece_index, offset, length));
            }
        }
        None
    }

    /// Delivers a received block. Ignored (not an error) if the block is
    /// not currently pending from `peer_id`, e.g. a late arrival after a
    /// timeout reassigned it, or a duplicate.
    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    pub fn block_received(
        &mut self,
        peer_id: PeerId,
        piece_index: usize,
        block_offset: u32,
        data: Vec<u8>,
    ) -> PieceResult<()> {
        let Some(piece) = self.pieces.get_mut(piece_index) else {
            debug!(piece_index, "block for unknown piece index, dropping");
            return Ok(());
        };
        let Some(block_index) = piece.block_index_for_offset(block_offset) else {
            debug!(piece_index, block_offset, "block for unknown offset, dropping");
            return Ok(());
        };
        let block = &mut piece.blocks[block_index];
        match &block.state {
            BlockState::Pending { peer_id: owner, .. } if *owner == peer_id => {
                block.state = BlockState::Retrieved(data);
            }
            _ => {
                debug!(piece_index, block_offset, "block not pending from this peer, dropping");
                return Ok(());
            }
        }

        if piece.all_retrieved() {
            self.verify_and_finalize_piece(piece_index)?;
        }
        Ok(())
    }

    fn verify_and_finalize_piece(&mut self, piece_index: usize) -> PieceResult<()> {
        let concatenated = self.pieces[piece_index].concatenated();
        let mut hasher = Sha1::new();
        hasher.update(&concatenated);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest != self.pieces[piece_index].expected_hash {
            warn!(piece_index, "piece failed hash verification, resetting for refetch");
            self.pieces[piece_index].reset_all_to_missing();
            return Ok(());
        }

        // Only mark the piece complete once its bytes are actually on disk;
        // a seek/write failure here must leave `complete` false so the
        // piece stays pending rather than reporting a download that never
        // fully landed.
        let offset = piece_index as u64 * self.piece_length;
        self.output.seek(SeekFrom::Start(offset))?;
        self.output.write_all(&concatenated)?;
        self.pieces[piece_index].complete = true;

        if self.complete() {
            self.output.sync_all()?;
        }
        Ok(())
    }

    /// True once every piece has verified against its expected digest.
    pub fn complete(&self) -> bool {
        self.pieces.iter().all(|p| p.complete)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.complete)
            .map(|(i, _)| {
                if i + 1 == self.pieces.len() {
                    self.total_length - (self.pieces.len() as u64 - 1) * self.piece_length
                } else {
                    self.piece_length
                }
            })
            .sum()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::tempfile_output;

    fn zero_hash_metainfo(piece_length: u64, piece_count: usize) -> Metainfo {
        let mut buf = vec![0u8; piece_length as usize];
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: [u8; 20] = hasher.finalize().into();
        buf.clear();
        Metainfo {
            announce: "http://t".to_string(),
            info_hash: [0u8; 20],
            piece_length,
            pieces: vec![hash; piece_count],
            name: "f".to_string(),
            length: piece_length * piece_count as u64,
        }
    }

    #[test]
    fn every_block_in_exactly_one_state_initially_missing() {
        let metainfo = zero_hash_metainfo(3 * BLOCK_SIZE as u64, 2);
        let path = tempfile_output::path("piece-manager-initial");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        let peer = [1u8; 20];
        pm.add_peer(peer, {
            let mut bf = Bitfield::empty(2);
            bf.set(0);
            bf.set(1);
            bf
        });
        // Every block is initially requestable (Missing), in order.
        for _ in 0..6 {
            assert!(pm.next_request(peer).is_some());
        }
        assert!(pm.next_request(peer).is_none());
    }

    #[test]
    fn stale_pending_reverts_to_missing_on_next_selection() {
        let metainfo = zero_hash_metainfo(BLOCK_SIZE as u64, 1);
        let path = tempfile_output::path("piece-manager-stale");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_millis(1)).unwrap();
        let peer = [2u8; 20];
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        pm.add_peer(peer, bf);

        let first = pm.next_request(peer).unwrap();
        assert!(pm.next_request(peer).is_none());
        std::thread::sleep(Duration::from_millis(5));
        let second = pm.next_request(peer).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn remove_peer_releases_its_pending_blocks() {
        let metainfo = zero_hash_metainfo(BLOCK_SIZE as u64, 1);
        let path = tempfile_output::path("piece-manager-remove-peer");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        let peer_a = [3u8; 20];
        let peer_b = [4u8; 20];
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        pm.add_peer(peer_a, bf.clone());
        pm.add_peer(peer_b, bf);

        let req = pm.next_request(peer_a).unwrap();
        assert!(pm.next_request(peer_b).is_none());
        pm.remove_peer(peer_a);
        let reissued = pm.next_request(peer_b).unwrap();
        assert_eq!(req, reissued);
    }

    #[test]
    fn hash_mismatch_resets_piece_and_makes_it_reselectable() {
        let metainfo = zero_hash_metainfo(BLOCK_SIZE as u64, 1);
        let path = tempfile_output::path("piece-manager-hash-mismatch");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        let peer = [5u8; 20];
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        pm.add_peer(peer, bf);

        let (index, offset, length) = pm.next_request(peer).unwrap();
        // Garbage data of the right length: hash will not match.
        pm.block_received(peer, index, offset, vec![0xFFu8; length as usize]).unwrap();
        assert!(!pm.complete());

        // Piece reset to Missing; the same block is selectable again.
        let (index2, offset2, _) = pm.next_request(peer).unwrap();
        assert_eq!((index2, offset2), (index, offset));
        pm.block_received(peer, index2, offset2, vec![0u8; length as usize]).unwrap();
        assert!(pm.complete());
    }

    #[test]
    fn completed_piece_is_never_reselected() {
        let metainfo = zero_hash_metainfo(BLOCK_SIZE as u64, 1);
        let path = tempfile_output::path("piece-manager-no-reselect");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        let peer = [6u8; 20];
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        pm.add_peer(peer, bf);

        let (index, offset, length) = pm.next_request(peer).unwrap();
        pm.block_received(peer, index, offset, vec![0u8; length as usize]).unwrap();
        assert!(pm.complete());
        assert!(pm.next_request(peer).is_none());
    }

    #[test]
    fn downloaded_bytes_equals_total_length_iff_complete() {
        let metainfo = zero_hash_metainfo(BLOCK_SIZE as u64, 1);
        let path = tempfile_output::path("piece-manager-downloaded-bytes");
        let mut pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        let peer = [7u8; 20];
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        pm.add_peer(peer, bf);
        assert_ne!(pm.downloaded_bytes(), pm.total_length());

        let (index, offset, length) = pm.next_request(peer).unwrap();
        pm.block_received(peer, index, offset, vec![0u8; length as usize]).unwrap();
        assert!(pm.complete());
        assert_eq!(pm.downloaded_bytes(), pm.total_length());
    }
}
