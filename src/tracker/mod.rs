//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client orchestrator to discover peers for a torrent and to
//! report download progress via the `started`/periodic/`completed` events.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::bencode::BencodeError;
use crate::torrent::Metainfo;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);
const PEER_ID_PREFIX: &[u8; 8] = b"-PC0001-";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker returned failure reason: {0}")]
    Failure(String),

    #[error("malformed tracker response: {0}")]
    Malformed(#[from] BencodeError),

    #[error("invalid announce URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("tracker unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// The three announce events a leecher reports over its session, per the
/// tracker HTTP protocol's `event` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The first announce of the session.
    Started,
    /// Sent once, when every piece has been verified.
    Completed,
    /// Periodic re-announce; `event` is omitted entirely on the wire.
    None,
}

impl TrackerEvent {
    fn as_query_value(self) -> Option<&'static str> {
        match self {
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::None => None,
        }
    }
}

/// A client communicating with a BitTorrent tracker on behalf of a single
/// download session. One peer-id is generated per `Client` and reused
/// across every announce in that session.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
}

/// The parameters for a single tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub event: TrackerEvent,
}

/// A peer address received from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response from a tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds the client should wait before the next periodic re-announce.
    pub interval: i64,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Client {
    /// Builds a tracker client with a freshly generated peer-id. Use this
    /// once per download session; every subsequent announce in that
    /// session (including periodic re-announces from a different task)
    /// must reuse the same peer-id, so callers needing another `Client`
    /// handle for the same session should use [`Client::with_peer_id`]
    /// instead of calling this again.
    pub fn new(port: u16) -> Self {
        Self::with_peer_id(generate_peer_id(), port)
    }

    /// Builds a tracker client that announces under an existing peer-id,
    /// for tasks (e.g. the periodic re-announce scheduler) that need their
    /// own `Client` handle but must present the same session identity.
    pub fn with_peer_id(peer_id: [u8; 20], port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .expect("reqwest client with static config always builds");
        Self { http, peer_id, port }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to `metainfo`'s tracker, reporting progress
    /// and the current session event.
    #[tracing::instrument(skip(self, metainfo), level = "debug")]
    pub async fn announce(
        &self,
        metainfo: &Metainfo,
        downloaded: u64,
        event: TrackerEvent,
    ) -> TrackerResult<AnnounceResponse> {
        let left = metainfo.length.saturating_sub(downloaded);
        let request = AnnounceRequest {
            info_hash: metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded,
            left,
            compact: true,
            event,
        };

        let mut url = url::Url::parse(&metainfo.announce)?;
        // `info_hash`/`peer_id` are raw 20-byte values, not UTF-8 text, so
        // `query_pairs_mut` (which form-urlencodes `&str` values) can't be
        // used for them without double-encoding our own percent escapes.
        // The whole query string is built by hand instead.
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            if request.compact { "1" } else { "0" },
        );
        if let Some(event) = request.event.as_query_value() {
            query.push_str("&event=");
            query.push_str(event);
        }
        url.set_query(Some(&query));

        tracing::debug!(
            %url,
            info_hash = %hex::encode(request.info_hash),
            event = ?request.event,
            "making announce request to tracker"
        );
        let response = self.http.get(url).send().await?;
        let response_bytes = response.bytes().await?;
        parse_announce_response(&response_bytes)
    }
}

/// Parses a bencoded tracker announce response, handling both the compact
/// and non-compact peer-list forms and surfacing `failure reason` as an
/// error rather than an empty peer list.
fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let tracker_response: TrackerResponse =
        serde_bencode::from_bytes(bytes).map_err(|e| {
            TrackerError::Malformed(BencodeError::Malformed(e.to_string()))
        })?;

    if let Some(reason) = tracker_response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let peers = match tracker_response.peers {
        Peers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer { ip: IpAddr::V4(ip), port }
            })
            .collect(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip.parse::<IpAddr>().ok().map(|ip| Peer { ip, port: dict.port })
            })
            .collect(),
    };

    Ok(AnnounceResponse { interval: tracker_response.interval, peers })
}

/// Generates a 20-byte Azureus-style peer-id: an 8-byte client prefix
/// (`-PC0001-`, "PC" for this client) followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

/// URL-encodes a raw byte slice per RFC 3986, leaving the unreserved
/// character set (`a-z A-Z 0-9 - . _ ~`) untouched. `info_hash` and
/// `peer_id` are raw 20-byte values, not UTF-8, so `Url`'s own encoders
/// (which operate on `&str`) can't be used directly for them.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_the_expected_prefix_and_length() {
        let client = Client::new(6881);
        assert_eq!(client.peer_id().len(), 20);
        assert_eq!(&client.peer_id()[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn two_clients_get_different_peer_ids() {
        let a = Client::new(6881);
        let b = Client::new(6881);
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn url_encode_leaves_unreserved_characters_alone() {
        assert_eq!(url_encode(b"abcXYZ019-._~"), "abcXYZ019-._~");
    }

    #[test]
    fn url_encode_percent_encodes_everything_else() {
        assert_eq!(url_encode(&[0x00, 0xFF, b' ']), "%00%FF%20");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.extend_from_slice(b"e");
        let parsed = parse_announce_response(&body).unwrap();
        assert_eq!(parsed.interval, 1800);
        assert_eq!(
            parsed.peers,
            vec![
                Peer { ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port: 6881 },
                Peer { ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port: 6882 },
            ]
        );
    }

    #[test]
    fn parses_non_compact_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let parsed = parse_announce_response(body).unwrap();
        assert_eq!(parsed.interval, 900);
        assert_eq!(parsed.peers[0].port, 6881);
    }

    #[test]
    fn failure_reason_surfaces_as_an_error() {
        let body = b"d14:failure reason20:torrent not trackede";
        let err = parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(msg) if msg == "torrent not tracked"));
    }
}
