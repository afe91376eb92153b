use crate::error::{BandlinkError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Maximum encodable TLV value length (15-bit length field)
pub const MAX_VALUE_LEN: usize = 0x7FFF;

/// A value stored under one TLV tag
///
/// Scalars are encoded big-endian on the wire. Values parsed off the wire are
/// held as [`TlvValue::Bytes`] and reinterpreted by the typed accessors on
/// [`Tlv`], which check the stored width against the requested kind.
#[derive(Debug, Clone)]
pub enum TlvValue {
    /// Single byte
    Byte(u8),
    /// 16-bit signed integer
    Short(i16),
    /// 32-bit signed integer
    Int(i32),
    /// UTF-8 string
    Str(String),
    /// Raw bytes (also the storage form for decoded values)
    Bytes(Vec<u8>),
    /// Nested TLV tree, flattened into the parent value on encode
    Tree(Tlv),
}

impl TlvValue {
    /// Serialize this value to its wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Byte(b) => vec![*b],
            Self::Short(s) => s.to_be_bytes().to_vec(),
            Self::Int(i) => i.to_be_bytes().to_vec(),
            Self::Str(s) => s.as_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
            Self::Tree(t) => t.encode(),
        }
    }
}

/// Tag-length-value tree used by the structured command protocol
///
/// Entries keep insertion order on encode. `put` replaces the value of an
/// existing tag in place (last write wins), so lookup-by-tag is unambiguous.
///
/// Wire format per entry: tag (1 byte), length (1 byte below 0x80, otherwise
/// 2 bytes with the high bit of the first set), value bytes. Decoding stores
/// every tag it encounters, known or not, so trees from newer firmware with
/// extra trailing tags parse without error.
#[derive(Debug, Clone, Default)]
pub struct Tlv {
    entries: Vec<(u8, TlvValue)>,
}

impl Tlv {
    /// Create an empty tree
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append or replace a tag's value, returning the tree for chaining
    #[must_use]
    pub fn put(mut self, tag: u8, value: TlvValue) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = value;
        } else {
            self.entries.push((tag, value));
        }
        self
    }

    /// Append or replace a single-byte value
    #[must_use]
    pub fn put_byte(self, tag: u8, value: u8) -> Self {
        self.put(tag, TlvValue::Byte(value))
    }

    /// Append or replace a 16-bit value
    #[must_use]
    pub fn put_short(self, tag: u8, value: i16) -> Self {
        self.put(tag, TlvValue::Short(value))
    }

    /// Append or replace a 32-bit value
    #[must_use]
    pub fn put_int(self, tag: u8, value: i32) -> Self {
        self.put(tag, TlvValue::Int(value))
    }

    /// Append or replace a string value
    #[must_use]
    pub fn put_string(self, tag: u8, value: impl Into<String>) -> Self {
        self.put(tag, TlvValue::Str(value.into()))
    }

    /// Append or replace a raw byte value
    #[must_use]
    pub fn put_bytes(self, tag: u8, value: impl Into<Vec<u8>>) -> Self {
        self.put(tag, TlvValue::Bytes(value.into()))
    }

    /// Append or replace a nested tree
    #[must_use]
    pub fn put_tree(self, tag: u8, value: Self) -> Self {
        self.put(tag, TlvValue::Tree(value))
    }

    /// Check whether a tag is present
    ///
    /// Some fields only exist on certain firmware versions; callers probe with
    /// this before reading to avoid a [`BandlinkError::MissingTag`].
    #[must_use]
    pub fn contains(&self, tag: u8) -> bool {
        self.entries.iter().any(|(t, _)| *t == tag)
    }

    /// Number of entries in the tree
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the tree has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw(&self, tag: u8) -> Result<Vec<u8>> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.to_bytes())
            .ok_or(BandlinkError::MissingTag { tag })
    }

    /// Get a single-byte value
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent, or
    /// [`BandlinkError::TypeMismatch`] if the stored value is not 1 byte wide.
    pub fn get_byte(&self, tag: u8) -> Result<u8> {
        let raw = self.raw(tag)?;
        if raw.len() != 1 {
            return Err(BandlinkError::TypeMismatch {
                tag,
                expected: "1-byte value",
                actual: raw.len(),
            });
        }
        Ok(raw[0])
    }

    /// Get a 16-bit big-endian value
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent, or
    /// [`BandlinkError::TypeMismatch`] if the stored value is not 2 bytes wide.
    pub fn get_short(&self, tag: u8) -> Result<i16> {
        let raw = self.raw(tag)?;
        if raw.len() != 2 {
            return Err(BandlinkError::TypeMismatch {
                tag,
                expected: "2-byte short",
                actual: raw.len(),
            });
        }
        Ok(i16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Get a 32-bit big-endian value
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent, or
    /// [`BandlinkError::TypeMismatch`] if the stored value is not 4 bytes wide.
    pub fn get_int(&self, tag: u8) -> Result<i32> {
        let raw = self.raw(tag)?;
        if raw.len() != 4 {
            return Err(BandlinkError::TypeMismatch {
                tag,
                expected: "4-byte integer",
                actual: raw.len(),
            });
        }
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Get a UTF-8 string value
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent, or
    /// [`BandlinkError::InvalidString`] if the bytes are not valid UTF-8.
    pub fn get_string(&self, tag: u8) -> Result<String> {
        let raw = self.raw(tag)?;
        String::from_utf8(raw).map_err(|_| BandlinkError::InvalidString { tag })
    }

    /// Get a value's raw bytes regardless of kind
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent.
    pub fn get_bytes(&self, tag: u8) -> Result<Vec<u8>> {
        self.raw(tag)
    }

    /// Get a nested tree, parsing the stored bytes if necessary
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::MissingTag`] if the tag is absent, or a parse
    /// error if the stored bytes are not a well-formed TLV sequence.
    pub fn get_tree(&self, tag: u8) -> Result<Self> {
        Self::decode(&self.raw(tag)?)
    }

    /// Encode the tree to its wire bytes in insertion order
    ///
    /// # Panics
    ///
    /// Panics if a value exceeds [`MAX_VALUE_LEN`] bytes; build oversized
    /// payloads as raw packets instead of TLV values.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (tag, value) in &self.entries {
            let bytes = value.to_bytes();
            assert!(
                bytes.len() <= MAX_VALUE_LEN,
                "TLV value for tag 0x{tag:02X} exceeds {MAX_VALUE_LEN} bytes"
            );
            buf.put_u8(*tag);
            put_length(&mut buf, bytes.len());
            buf.extend_from_slice(&bytes);
        }
        buf.to_vec()
    }

    /// Parse a TLV tree from wire bytes
    ///
    /// Unrecognized tags are stored like any other and do not fail the parse.
    ///
    /// # Errors
    ///
    /// Returns [`BandlinkError::Truncated`] if a declared length runs past the
    /// end of the buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let mut tree = Self::new();
        while buf.has_remaining() {
            let tag = buf.get_u8();
            let len = get_length(&mut buf)?;
            if buf.remaining() < len {
                return Err(BandlinkError::Truncated {
                    needed: len,
                    remaining: buf.remaining(),
                });
            }
            let value = buf[..len].to_vec();
            buf.advance(len);
            tree = tree.put(tag, TlvValue::Bytes(value));
        }
        Ok(tree)
    }
}

/// Trees compare equal when their wire encodings are identical, so a decoded
/// tree equals the tree it was encoded from even though decoded values are
/// stored as raw bytes.
impl PartialEq for Tlv {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl Eq for Tlv {}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u8(0x80 | ((len >> 8) as u8));
        buf.put_u8((len & 0xFF) as u8);
    }
}

fn get_length(buf: &mut &[u8]) -> Result<usize> {
    if !buf.has_remaining() {
        return Err(BandlinkError::Truncated {
            needed: 1,
            remaining: 0,
        });
    }
    let first = buf.get_u8();
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    if !buf.has_remaining() {
        return Err(BandlinkError::Truncated {
            needed: 1,
            remaining: 0,
        });
    }
    let second = buf.get_u8();
    Ok((((first & 0x7F) as usize) << 8) | second as usize)
}
