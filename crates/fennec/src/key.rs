//! Row keys.
//!
//! A [`RowKey`] is the identity of one row: an opaque, immutable byte string
//! compared bytewise. The store never interprets a key beyond its length and
//! equality, but the encoding doubles as a mapping from dimension names to
//! values so the query layer can evaluate filters against it without a
//! side-channel.
//!
//! Encoding: a concatenation of `name_len u16 BE | name | value_len u16 BE |
//! value` entries, with names sorted so equal dimension sets always produce
//! equal keys.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum encoded length of a row key in bytes.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// An opaque, immutable row key.
///
/// Cloning is cheap: the encoded bytes are shared, never copied.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(Bytes);

impl RowKey {
    /// Builds a key from dimension `(name, value)` pairs.
    ///
    /// Names are sorted before encoding so the same dimension set always
    /// yields the same key, regardless of the order the caller supplies.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by_key(|&(name, _)| name);

        let mut buf = BytesMut::new();
        for (name, value) in pairs {
            buf.put_u16(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
        }
        debug_assert!(buf.len() <= MAX_KEY_LEN);
        Self(buf.freeze())
    }

    /// Wraps already-encoded key bytes, e.g. read back from the durable file.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-dimension key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the value stored under `name`, if present.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.pairs().find(|&(n, _)| n == name).map(|(_, v)| v)
    }

    /// Iterates the decoded `(name, value)` pairs.
    ///
    /// Decoding stops at the first malformed entry; a key built by
    /// [`RowKey::from_pairs`] always decodes completely.
    pub fn pairs(&self) -> Pairs<'_> {
        Pairs { rest: &self.0 }
    }
}

impl AsRef<[u8]> for RowKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.pairs() {
            map.entry(&name, &String::from_utf8_lossy(value));
        }
        map.finish()
    }
}

/// Iterator over the decoded dimension pairs of a [`RowKey`].
pub struct Pairs<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Pairs<'a> {
    type Item = (&'a str, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 2 {
            return None;
        }
        let name_len = BigEndian::read_u16(self.rest) as usize;
        let rest = &self.rest[2..];
        if rest.len() < name_len + 2 {
            return None;
        }
        let name = std::str::from_utf8(&rest[..name_len]).ok()?;
        let rest = &rest[name_len..];
        let value_len = BigEndian::read_u16(rest) as usize;
        let rest = &rest[2..];
        if rest.len() < value_len {
            return None;
        }
        let value = &rest[..value_len];
        self.rest = &rest[value_len..];
        Some((name, value))
    }
}
