//! Torrent metainfo: the parsed contents of a single-file `.torrent`.

use std::collections::BTreeMap;
use std::ops::Range;

use sha1::{Digest, Sha1};

use crate::bencode::{BencodeValue, Decoder};

use super::{MetainfoError, MetainfoResult};

/// A parsed single-file torrent descriptor. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    /// SHA-1 over the exact bytes of the `info` dictionary as it appeared
    /// on the wire, not a re-encoding of the parsed value.
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub name: String,
    pub length: u64,
}

impl Metainfo {
    /// Parses a bencoded `.torrent` file. Rejects multi-file torrents
    /// (an `info.files` list) with [`MetainfoError::UnsupportedTorrent`].
    pub fn parse(data: &[u8]) -> MetainfoResult<Self> {
        let mut decoder = Decoder::new(data);
        let (top, info_span) = decode_top_level(&mut decoder)?;

        let announce = take_string(&top, "announce")?;

        let info_value = top
            .get(b"info".as_slice())
            .ok_or_else(|| MetainfoError::MissingField("info".to_string()))?;
        let info_dict = match info_value {
            BencodeValue::Dict(d) => d,
            _ => return Err(MetainfoError::Malformed("'info' is not a dictionary".to_string())),
        };

        if info_dict.contains_key(b"files".as_slice()) {
            return Err(MetainfoError::UnsupportedTorrent);
        }

        let piece_length = take_integer(info_dict, "piece length")?;
        if piece_length <= 0 {
            return Err(MetainfoError::Malformed("'piece length' must be positive".to_string()));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = take_bytes(info_dict, "pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesHashLength);
        }
        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunk is exactly 20 bytes"))
            .collect();

        let name = take_string(info_dict, "name")?;
        let length = take_integer(info_dict, "length")?;
        if length < 0 {
            return Err(MetainfoError::Malformed("'length' must be non-negative".to_string()));
        }
        let length = length as u64;

        let expected_piece_count = length.div_ceil(piece_length) as usize;
        if expected_piece_count != pieces.len() {
            return Err(MetainfoError::Malformed(format!(
                "expected {} pieces for length {} at piece_length {}, got {}",
                expected_piece_count,
                length,
                piece_length,
                pieces.len()
            )));
        }

        let info_hash = sha1_of(&decoder.input()[info_span]);

        Ok(Metainfo {
            announce,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// The byte length of piece `index`: `piece_length` for every piece
    /// except possibly the last, which may be shorter.
    pub fn piece_length_of(&self, index: usize) -> u64 {
        if index >= self.pieces.len() {
            return 0;
        }
        if index + 1 < self.pieces.len() {
            self.piece_length
        } else {
            let full = (self.pieces.len() as u64 - 1) * self.piece_length;
            self.length - full
        }
    }
}

fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Walks a top-level bencoded dictionary, recording the byte range of the
/// `info` value as it is decoded. This is strategy (a) for info-hash
/// stability: the info-hash is computed from the literal bytes the
/// dictionary occupied on the wire, never from a re-encoding.
fn decode_top_level(
    decoder: &mut Decoder,
) -> MetainfoResult<(BTreeMap<Vec<u8>, BencodeValue>, Range<usize>)> {
    decoder.expect_byte(b'd')?;
    let mut dict = BTreeMap::new();
    let mut info_span = None;
    loop {
        if decoder.peek_byte()? == b'e' {
            decoder.expect_byte(b'e')?;
            break;
        }
        let key = decoder.decode_bytes()?;
        let value_start = decoder.position();
        let value = decoder.decode_value()?;
        let value_end = decoder.position();
        if key == b"info" {
            info_span = Some(value_start..value_end);
        }
        dict.insert(key, value);
    }
    let info_span = info_span.ok_or_else(|| MetainfoError::MissingField("info".to_string()))?;
    Ok((dict, info_span))
}

fn take_string(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> MetainfoResult<String> {
    let bytes = take_bytes(dict, key)?;
    String::from_utf8(bytes)
        .map_err(|e| MetainfoError::Malformed(format!("'{key}' is not valid UTF-8: {e}")))
}

fn take_bytes(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> MetainfoResult<Vec<u8>> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Bytes(b)) => Ok(b.clone()),
        Some(_) => Err(MetainfoError::Malformed(format!("'{key}' is not a string"))),
        None => Err(MetainfoError::MissingField(key.to_string())),
    }
}

fn take_integer(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> MetainfoResult<i64> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Integer(i)) => Ok(*i),
        Some(_) => Err(MetainfoError::Malformed(format!("'{key}' is not an integer"))),
        None => Err(MetainfoError::MissingField(key.to_string())),
    }
}
