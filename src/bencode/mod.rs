//! Bencoding: the byte-string/integer/list/dictionary serialization format
//! used by metainfo files and tracker responses.
//!
//! Decoding is cursor-based rather than iterator-based so that callers who
//! need the exact byte range of a sub-value (the `info` dictionary, to
//! compute an info-hash that survives round-tripping) can record it while
//! walking the input. See [`Decoder`].

use std::collections::BTreeMap;

use thiserror::Error;

/// A decoded bencode value.
///
/// Dictionaries use a [`BTreeMap`] rather than a [`std::collections::HashMap`]
/// so that iteration order is always the byte-lexicographic key order the
/// encoder is required to produce, so the sort step is free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("malformed bencoding: {0}")]
    Malformed(String),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("{0} trailing byte(s) after top-level value")]
    TrailingBytes(usize),
}

pub type BencodeResult<T> = Result<T, BencodeError>;

/// A cursor over a byte slice that decodes bencoded values while exposing
/// its position, so callers can capture the raw byte range of any
/// sub-value as they walk past it (needed for info-hash computation).
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte offset into the original input.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// The original input this decoder was constructed from.
    pub fn input(&self) -> &'a [u8] {
        self.data
    }

    /// Peeks the next byte without consuming it. Exposed crate-wide so
    /// callers that need to hand-walk a dictionary (to capture a
    /// sub-value's byte span, as `torrent::metainfo` does) can do so with
    /// the same primitives the generic decoder uses.
    pub(crate) fn peek_byte(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn take_byte(&mut self) -> BencodeResult<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn expect_byte(&mut self, expected: u8) -> BencodeResult<()> {
        let b = self.take_byte()?;
        if b != expected {
            return Err(BencodeError::Malformed(format!(
                "expected '{}', found '{}'",
                expected as char, b as char
            )));
        }
        Ok(())
    }

    /// Reads bytes up to (and consuming) `delimiter`, returned as an ASCII
    /// string. Used for length prefixes and integer bodies.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<String> {
        let start = self.pos;
        loop {
            let b = self.peek_byte()?;
            if b == delimiter {
                let s = std::str::from_utf8(&self.data[start..self.pos])
                    .map_err(|e| BencodeError::Malformed(format!("non-UTF8 token: {e}")))?
                    .to_string();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
    }

    /// Decodes a bencode byte string (`<len>:<bytes>`).
    pub fn decode_bytes(&mut self) -> BencodeResult<Vec<u8>> {
        let len_str = self.read_until(b':')?;
        if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
            return Err(BencodeError::Malformed(format!(
                "invalid string length prefix: {len_str:?}"
            )));
        }
        let len: usize = len_str
            .parse()
            .map_err(|_| BencodeError::Malformed(format!("invalid string length: {len_str:?}")))?;
        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    /// Decodes a bencode integer (`i<decimal>e`).
    pub fn decode_integer(&mut self) -> BencodeResult<i64> {
        self.expect_byte(b'i')?;
        let num_str = self.read_until(b'e')?;
        if num_str.is_empty() {
            return Err(BencodeError::Malformed("empty integer".to_string()));
        }
        if num_str == "-0" {
            return Err(BencodeError::Malformed("'-0' is not a valid integer".to_string()));
        }
        let digits = num_str.strip_prefix('-').unwrap_or(&num_str);
        if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
            return Err(BencodeError::Malformed(format!(
                "integer has leading zero: {num_str:?}"
            )));
        }
        num_str
            .parse()
            .map_err(|_| BencodeError::Malformed(format!("invalid integer: {num_str:?}")))
    }

    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.expect_byte(b'l')?;
        let mut items = Vec::new();
        loop {
            if self.peek_byte()? == b'e' {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.decode_value()?);
        }
    }

    fn decode_dict(&mut self) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        self.expect_byte(b'd')?;
        let mut dict = BTreeMap::new();
        loop {
            if self.peek_byte()? == b'e' {
                self.pos += 1;
                return Ok(dict);
            }
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
    }

    /// Decodes a single bencode value of any type, dispatching on the next
    /// byte's tag character.
    pub fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek_byte()? {
            b'0'..=b'9' => self.decode_bytes().map(BencodeValue::Bytes),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::Malformed(format!(
                "unexpected tag byte: '{}'",
                other as char
            ))),
        }
    }
}

/// Decodes a single top-level bencode value, rejecting any trailing bytes.
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut decoder = Decoder::new(data);
    let value = decoder.decode_value()?;
    if !decoder.is_at_end() {
        return Err(BencodeError::TrailingBytes(data.len() - decoder.position()));
    }
    Ok(value)
}

fn encode_value(out: &mut Vec<u8>, value: &BencodeValue) {
    match value {
        BencodeValue::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        BencodeValue::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(out, item);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(dict) => {
            out.push(b'd');
            // BTreeMap already iterates in sorted key order.
            for (key, value) in dict {
                encode_value(out, &BencodeValue::Bytes(key.clone()));
                encode_value(out, value);
            }
            out.push(b'e');
        }
    }
}

/// Encodes a [`BencodeValue`] into its canonical bencoded byte representation.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(&mut out, value);
    out
}
