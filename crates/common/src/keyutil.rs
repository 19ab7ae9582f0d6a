//! Byte-key helpers shared by the region registry and the schedulers.
//!
//! Keys are opaque byte strings ordered lexicographically. Ranges are
//! half-open `[start, end)`; an empty end key means "+infinity", so the
//! empty-empty range covers the whole key domain.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Returns the bigger of two keys.
pub fn max_key<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    if a > b {
        a
    } else {
        b
    }
}

/// Returns the smaller of two keys.
pub fn min_key<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    if a > b {
        b
    } else {
        a
    }
}

/// Returns the bigger start key; the empty key is the biggest.
pub fn max_start_key<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    if a.is_empty() {
        a
    } else if b.is_empty() {
        b
    } else {
        max_key(a, b)
    }
}

/// Returns the smaller end key; the empty key is the biggest.
pub fn min_end_key<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    if a.is_empty() {
        b
    } else if b.is_empty() {
        a
    } else {
        min_key(a, b)
    }
}

/// Returns whether `key` falls inside the half-open range `[start, end)`.
pub fn contains(start: &[u8], end: &[u8], key: &[u8]) -> bool {
    key >= start && (end.is_empty() || key < end)
}

/// Renders a key as lowercase hex for logs and labels.
pub fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

/// One half-open key range `[start_key, end_key)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive start key.
    #[serde(rename = "start-key")]
    pub start_key: Vec<u8>,
    /// Exclusive end key; empty means +infinity.
    #[serde(rename = "end-key")]
    pub end_key: Vec<u8>,
}

impl KeyRange {
    /// Builds a range from borrowed keys.
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// Returns whether `key` falls inside this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        contains(&self.start_key, &self.end_key, key)
    }

    /// Returns whether this range and `[start, end)` share any key.
    ///
    /// Both bounds are half-open: an empty start is the lower bound of the
    /// key domain, an empty end is +infinity, so adjacent ranges that only
    /// touch at a boundary do not overlap.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        (self.end_key.is_empty() || start.is_empty() || start < self.end_key.as_slice())
            && (end.is_empty() || self.start_key.is_empty() || self.start_key.as_slice() < end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex_key(&self.start_key), hex_key(&self.end_key))
    }
}

/// An ordered list of key ranges, as supplied to batch scans and
/// balance-range jobs.
#[derive(Debug, Clone, Default)]
pub struct KeyRanges {
    ranges: Vec<KeyRange>,
}

impl KeyRanges {
    /// Creates an empty collection with reserved capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(cap),
        }
    }

    /// Appends one range.
    pub fn append(&mut self, start_key: Vec<u8>, end_key: Vec<u8>) {
        self.ranges.push(KeyRange {
            start_key,
            end_key,
        });
    }

    /// Borrows the contained ranges in insertion order.
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Consumes the collection, yielding the contained ranges.
    pub fn into_ranges(self) -> Vec<KeyRange> {
        self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_end_key_is_infinite() {
        assert!(contains(b"b", b"", b"b"));
        assert!(contains(b"b", b"", b"zzzz"));
        assert!(!contains(b"b", b"", b"a"));

        assert!(contains(b"b", b"d", b"b"));
        assert!(contains(b"b", b"d", b"c"));
        assert!(!contains(b"b", b"d", b"d"));
        assert!(!contains(b"b", b"d", b"a"));
    }

    #[test]
    fn start_end_key_ordering() {
        assert_eq!(max_start_key(b"a", b"b"), b"b");
        assert_eq!(max_start_key(b"", b"b"), b"");
        assert_eq!(min_end_key(b"a", b"b"), b"a");
        assert_eq!(min_end_key(b"", b"b"), b"b");
        assert_eq!(min_end_key(b"a", b""), b"a");
    }

    #[test]
    fn range_overlap() {
        let r = KeyRange::new(b"b".to_vec(), b"d".to_vec());
        assert!(r.overlaps(b"a", b"c"));
        assert!(r.overlaps(b"c", b""));
        assert!(!r.overlaps(b"d", b"e"));
        assert!(!r.overlaps(b"", b"b"));

        let unbounded = KeyRange::new(b"".to_vec(), b"".to_vec());
        assert!(unbounded.overlaps(b"x", b"y"));
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(hex_key(&[0x0a, 0xff]), "0aff");
        assert_eq!(
            KeyRange::new(b"a".to_vec(), b"b".to_vec()).to_string(),
            "61-62"
        );
    }
}
