//! A single peer connection, driven strictly leecher-side: this client
//! never sends `have`, `bitfield`, `unchoke`, or `piece`; it only asks
//! for blocks and receives them.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::piece::PieceManager;
use crate::wire::{self, FrameParser, Handshake, Message};

use super::{PeerError, PeerId, PeerResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const READ_BUF_SIZE: usize = 16 * 1024 + 64;

/// The lifecycle of a single outbound peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    HandshakeSent,
    HandshakeReceived,
    Active,
    Closed,
}

/// Drives one TCP connection to a remote peer: handshake, then a
/// request/receive loop against the shared [`PieceManager`], with at most
/// one block request in flight at a time.
pub struct PeerConnection {
    state: PeerState,
    remote_peer_id: Option<PeerId>,
    /// Always `true`: this client never sends `unchoke`.
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    has_pending_request: bool,
}

impl PeerConnection {
    pub fn new() -> Self {
        Self {
            state: PeerState::Connecting,
            remote_peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            has_pending_request: false,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Drives the connection end to end: handshake, then the
    /// request/receive loop, until the remote closes the stream, a
    /// protocol error occurs, every piece completes, or `cancellation`
    /// fires.
    #[instrument(skip(self, stream, piece_manager, cancellation), fields(addr = %addr))]
    pub async fn run(
        &mut self,
        addr: std::net::SocketAddr,
        mut stream: TcpStream,
        info_hash: [u8; 20],
        our_peer_id: PeerId,
        piece_manager: Rc<RefCell<PieceManager>>,
        cancellation: CancellationToken,
    ) -> PeerResult<()> {
        self.handshake(&mut stream, info_hash, our_peer_id).await?;
        self.state = PeerState::Active;

        let interested = wire::encode(&Message::Interested);
        stream.write_all(&interested).await?;
        self.am_interested = true;

        let mut parser = FrameParser::new();
        let mut read_buf = vec![0u8; READ_BUF_SIZE];

        loop {
            if piece_manager.borrow().complete() {
                debug!("download complete, closing peer connection");
                break;
            }

            if !self.peer_choking && !self.has_pending_request {
                let remote = self.remote_peer_id.expect("active connection has a remote peer id");
                let request = piece_manager.borrow_mut().next_request(remote);
                if let Some((index, begin, length)) = request {
                    let message = Message::Request { index: index as u32, begin, length };
                    stream.write_all(&wire::encode(&message)).await?;
                    self.has_pending_request = true;
                }
            }

            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!("cancellation requested, closing peer connection");
                    break;
                }
                result = stream.read(&mut read_buf) => {
                    let n = result?;
                    if n == 0 {
                        debug!("peer closed the connection");
                        break;
                    }
                    parser.push(&read_buf[..n]);
                    for message in parser.drain_messages()? {
                        self.handle_message(message, &piece_manager)?;
                    }
                }
            }
        }

        self.state = PeerState::Closed;
        if let Some(remote) = self.remote_peer_id {
            piece_manager.borrow_mut().remove_peer(remote);
        }
        Ok(())
    }

    async fn handshake(
        &mut self,
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        our_peer_id: PeerId,
    ) -> PeerResult<()> {
        let outgoing = Handshake::new(info_hash, our_peer_id);
        outgoing.write(stream).await.map_err(PeerError::Protocol)?;
        self.state = PeerState::HandshakeSent;

        let incoming = Handshake::read(stream, HANDSHAKE_TIMEOUT)
            .await
            .map_err(PeerError::Protocol)?;
        incoming.validate_info_hash(&info_hash).map_err(PeerError::Protocol)?;
        self.remote_peer_id = Some(incoming.peer_id);
        self.state = PeerState::HandshakeReceived;
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: Message,
        piece_manager: &Rc<RefCell<PieceManager>>,
    ) -> PeerResult<()> {
        let remote = self.remote_peer_id.expect("messages only arrive after handshake");
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
            }
            Message::Unchoke => {
                self.peer_choking = false;
            }
            Message::Interested => {
                self.peer_interested = true;
            }
            Message::NotInterested => {
                self.peer_interested = false;
            }
            Message::Have { piece_index } => {
                piece_manager.borrow_mut().update_peer(remote, piece_index as usize);
            }
            Message::Bitfield(bitfield) => {
                piece_manager.borrow_mut().add_peer(remote, bitfield);
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                // This client never has data to serve; silently ignored.
            }
            Message::Piece { index, begin, block } => {
                self.has_pending_request = false;
                // A hash mismatch is handled internally by the piece manager
                // (reset to Missing, non-fatal); only a genuine file I/O
                // failure reaches here, and that is fatal to the session.
                piece_manager
                    .borrow_mut()
                    .block_received(remote, index as usize, begin, block)
                    .map_err(PeerError::Fatal)?;
            }
            Message::Port(_) => {
                // DHT port advertisement; this client does not run a DHT node.
            }
            Message::Unknown { id, .. } => {
                warn!(id, "ignoring unrecognized message id");
            }
        }
        Ok(())
    }
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Metainfo;
    use sha1::{Digest, Sha1};

    #[test]
    fn new_connection_starts_in_connecting_state_and_choked() {
        let conn = PeerConnection::new();
        assert_eq!(conn.state(), PeerState::Connecting);
        assert!(conn.peer_choking);
        assert!(!conn.am_interested);
        assert!(!conn.has_pending_request);
    }

    fn single_piece_manager() -> (Rc<RefCell<PieceManager>>, PeerId) {
        let piece_length = 16384u64;
        let mut hasher = Sha1::new();
        hasher.update(vec![0u8; piece_length as usize]);
        let hash: [u8; 20] = hasher.finalize().into();
        let metainfo = Metainfo {
            announce: "http://t".to_string(),
            info_hash: [0u8; 20],
            piece_length,
            pieces: vec![hash],
            name: "f".to_string(),
            length: piece_length,
        };
        let mut path = std::env::temp_dir();
        path.push(format!(
            "leechcore-test-peer-conn-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let pm = PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap();
        (Rc::new(RefCell::new(pm)), [9u8; 20])
    }

    #[test]
    fn unchoke_clears_choking_and_bitfield_registers_peer() {
        let (pm, remote) = single_piece_manager();
        let mut conn = PeerConnection::new();
        conn.remote_peer_id = Some(remote);

        conn.handle_message(Message::Unchoke, &pm).unwrap();
        assert!(!conn.peer_choking);

        let mut bitfield = crate::wire::Bitfield::empty(1);
        bitfield.set(0);
        conn.handle_message(Message::Bitfield(bitfield), &pm).unwrap();
        assert!(pm.borrow_mut().next_request(remote).is_some());
    }

    #[test]
    fn piece_message_clears_pending_flag_and_feeds_piece_manager() {
        let (pm, remote) = single_piece_manager();
        let mut conn = PeerConnection::new();
        conn.remote_peer_id = Some(remote);
        conn.has_pending_request = true;

        let mut bitfield = crate::wire::Bitfield::empty(1);
        bitfield.set(0);
        pm.borrow_mut().add_peer(remote, bitfield);
        let (index, begin, length) = pm.borrow_mut().next_request(remote).unwrap();

        conn.handle_message(
            Message::Piece { index: index as u32, begin, block: vec![0u8; length as usize] },
            &pm,
        )
        .unwrap();

        assert!(!conn.has_pending_request);
        assert!(pm.borrow().complete());
    }

    /// End-to-end over a real loopback `TcpStream`: a stub peer claims every
    /// piece, unchokes, then answers each `request(i, b, l)` with
    /// `piece(i, b, <zeros>)`. For a 3-piece/3-block-per-piece torrent this
    /// must drive the download to completion in exactly nine requests.
    #[tokio::test]
    async fn stub_peer_drives_full_download_to_completion() {
        use tokio::net::TcpListener;

        let piece_length = 3 * crate::piece::BLOCK_SIZE as u64;
        let piece_count = 3usize;
        let mut hasher = Sha1::new();
        hasher.update(vec![0u8; piece_length as usize]);
        let hash: [u8; 20] = hasher.finalize().into();
        let info_hash = [3u8; 20];
        let metainfo = Metainfo {
            announce: "http://t".to_string(),
            info_hash,
            piece_length,
            pieces: vec![hash; piece_count],
            name: "f".to_string(),
            length: piece_length * piece_count as u64,
        };
        let mut path = std::env::temp_dir();
        path.push(format!(
            "leechcore-test-stub-peer-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let piece_manager = Rc::new(RefCell::new(
            PieceManager::new(&metainfo, &path, Duration::from_secs(5)).unwrap(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let incoming = Handshake::read(&mut stream, Duration::from_secs(5)).await.unwrap();
            assert_eq!(incoming.info_hash, info_hash);
            Handshake::new(info_hash, [42u8; 20]).write(&mut stream).await.unwrap();

            let mut bitfield = crate::wire::Bitfield::empty(piece_count);
            for i in 0..piece_count {
                bitfield.set(i);
            }
            stream.write_all(&wire::encode(&Message::Bitfield(bitfield))).await.unwrap();
            stream.write_all(&wire::encode(&Message::Unchoke)).await.unwrap();

            let mut parser = FrameParser::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut request_count = 0usize;
            while request_count < piece_count * 3 {
                let n = stream.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "client closed before sending every expected request");
                parser.push(&buf[..n]);
                for message in parser.drain_messages().unwrap() {
                    if let Message::Request { index, begin, length } = message {
                        request_count += 1;
                        let block = vec![0u8; length as usize];
                        stream
                            .write_all(&wire::encode(&Message::Piece { index, begin, block }))
                            .await
                            .unwrap();
                    }
                }
            }
            request_count
        });

        let client_stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut connection = PeerConnection::new();
        connection
            .run(addr, client_stream, info_hash, [7u8; 20], piece_manager.clone(), CancellationToken::new())
            .await
            .unwrap();

        let request_count = server.await.unwrap();
        assert_eq!(request_count, piece_count * 3);
        assert!(piece_manager.borrow().complete());
    }
}
