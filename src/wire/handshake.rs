//! The fixed 68-byte BitTorrent peer handshake.
//!
//! Adapted from the reference client's `peer::handshake` module: the wire
//! layout is unchanged, but reading is now bounded by a caller-supplied
//! timeout and failures are typed ([`WireError`]) instead of `anyhow`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::WireError;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A BitTorrent handshake message: protocol identifier, reserved
/// extension bytes, info-hash, and peer-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes this handshake into its 68-byte wire form:
    /// `0x13 || "BitTorrent protocol" || 8 reserved zero bytes || info_hash || peer_id`.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] left as the reserved all-zero bytes.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a 68-byte handshake buffer. Any mismatch in the length byte
    /// or protocol string is a fatal [`WireError::Protocol`] for the
    /// connection that sent it.
    pub fn parse(buf: &[u8; 68]) -> Result<Self, WireError> {
        if buf[0] != 19 {
            return Err(WireError::Protocol(format!(
                "invalid protocol string length: {}",
                buf[0]
            )));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(WireError::Protocol("unrecognized protocol string".to_string()));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Sends this handshake over `stream`.
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, stream: &mut W) -> Result<(), WireError> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    /// Reads and parses a handshake from `stream`, bounded by `timeout_dur`.
    pub async fn read<R: AsyncReadExt + Unpin>(
        stream: &mut R,
        timeout_dur: Duration,
    ) -> Result<Self, WireError> {
        let mut buf = [0u8; 68];
        timeout(timeout_dur, stream.read_exact(&mut buf))
            .await
            .map_err(|_| WireError::HandshakeTimedOut)??;
        Self::parse(&buf)
    }

    /// Validates that this handshake's info-hash matches the session's.
    pub fn validate_info_hash(&self, expected: &[u8; 20]) -> Result<(), WireError> {
        if &self.info_hash != expected {
            return Err(WireError::Protocol("info-hash mismatch".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(Handshake::parse(&bytes).unwrap(), hs);
    }

    #[test]
    fn parses_the_documented_byte_layout() {
        let mut bytes = [0u8; 68];
        bytes[0] = 0x13;
        bytes[1..20].copy_from_slice(b"BitTorrent protocol");
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        bytes[28..48].copy_from_slice(&info_hash);
        bytes[48..68].copy_from_slice(&peer_id);

        let hs = Handshake::parse(&bytes).unwrap();
        assert_eq!(hs.info_hash, info_hash);
        assert_eq!(hs.peer_id, peer_id);
    }

    #[test]
    fn rejects_wrong_protocol_length_byte() {
        let mut bytes = [0u8; 68];
        bytes[0] = 0x12;
        bytes[1..20].copy_from_slice(b"BitTorrent protocol");
        assert!(matches!(Handshake::parse(&bytes), Err(WireError::Protocol(_))));
    }

    #[test]
    fn rejects_mismatched_protocol_string() {
        let mut bytes = [0u8; 68];
        bytes[0] = 0x13;
        bytes[1..20].copy_from_slice(b"NotTheRightProtocol");
        assert!(matches!(Handshake::parse(&bytes), Err(WireError::Protocol(_))));
    }

    #[test]
    fn validate_info_hash_rejects_mismatch() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate_info_hash(&[9u8; 20]).is_err());
        assert!(hs.validate_info_hash(&[1u8; 20]).is_ok());
    }
}
