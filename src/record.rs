//! Fixed-width record geometry and flat record batches.
//!
//! A record is `digest (D bytes) || nonce (N bytes)`. Records carry no framing, so
//! a shard, a spill segment and a [`RecordBatch`] are all just concatenations of
//! `D + N` byte rows, and byte-wise comparison of two rows orders them by digest
//! first with the nonce as tie-break.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::slice::ChunksExact;

/// Digest width used by the original vault format.
pub const DEFAULT_DIGEST_LEN: usize = 10;
/// Nonce width used by the original vault format.
pub const DEFAULT_NONCE_LEN: usize = 6;
pub const MAX_DIGEST_LEN: usize = 32;
pub const MAX_NONCE_LEN: usize = 16;
pub const MAX_RECORD_LEN: usize = MAX_DIGEST_LEN + MAX_NONCE_LEN;

/// Widths of the two record fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLayout {
    pub digest_len: usize,
    pub nonce_len: usize,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DIGEST_LEN, DEFAULT_NONCE_LEN)
    }
}

impl RecordLayout {
    #[must_use]
    pub const fn new(digest_len: usize, nonce_len: usize) -> Self {
        Self {
            digest_len,
            nonce_len,
        }
    }

    /// Total width of one record in bytes.
    #[inline]
    #[must_use]
    pub const fn record_len(&self) -> usize {
        self.digest_len + self.nonce_len
    }

    /// # Errors
    ///
    /// Returns an error if either field is empty or wider than the supported maximum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DIGEST_LEN).contains(&self.digest_len) {
            return Err(ConfigError(format!(
                "digest length {} outside 1..={MAX_DIGEST_LEN}",
                self.digest_len
            )));
        }
        if !(1..=MAX_NONCE_LEN).contains(&self.nonce_len) {
            return Err(ConfigError(format!(
                "nonce length {} outside 1..={MAX_NONCE_LEN}",
                self.nonce_len
            )));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn digest<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[..self.digest_len]
    }

    #[inline]
    #[must_use]
    pub fn nonce<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[self.digest_len..self.record_len()]
    }

    /// Number of whole records in `bytes`, or `None` if the length is not a multiple
    /// of the record width.
    #[must_use]
    pub const fn count_records(&self, bytes: usize) -> Option<usize> {
        let width = self.record_len();
        if width == 0 || bytes % width != 0 {
            None
        } else {
            Some(bytes / width)
        }
    }
}

/// A contiguous buffer of fixed-width records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordBatch {
    layout: RecordLayout,
    bytes: Vec<u8>,
}

impl RecordBatch {
    #[must_use]
    pub const fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            bytes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(layout: RecordLayout, records: usize) -> Self {
        Self {
            layout,
            bytes: Vec::with_capacity(records * layout.record_len()),
        }
    }

    /// Wrap raw concatenated records.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` does not hold a whole number of records.
    pub fn from_bytes(layout: RecordLayout, bytes: Vec<u8>) -> anyhow::Result<Self> {
        if layout.count_records(bytes.len()).is_none() {
            anyhow::bail!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                layout.record_len()
            );
        }
        Ok(Self { layout, bytes })
    }

    #[must_use]
    pub const fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.layout.record_len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Append one record.
    ///
    /// # Panics
    ///
    /// Panics if `record` is not exactly one record wide.
    pub fn push(&mut self, record: &[u8]) {
        assert_eq!(
            record.len(),
            self.layout.record_len(),
            "record width does not match layout"
        );
        self.bytes.extend_from_slice(record);
    }

    /// Append a zeroed record and hand it out for filling in place.
    pub(crate) fn push_uninit(&mut self) -> &mut [u8] {
        let start = self.bytes.len();
        self.bytes.resize(start + self.layout.record_len(), 0);
        &mut self.bytes[start..]
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        let width = self.layout.record_len();
        self.bytes.get(index * width..(index + 1) * width)
    }

    pub fn iter(&self) -> ChunksExact<'_, u8> {
        self.bytes.chunks_exact(self.layout.record_len())
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl<'a> IntoIterator for &'a RecordBatch {
    type Item = &'a [u8];
    type IntoIter = ChunksExact<'a, u8>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Render a record as `<hex digest> nonce=<decimal>`, reading the nonce little-endian.
#[must_use]
pub fn format_record(layout: RecordLayout, record: &[u8]) -> String {
    let nonce = layout
        .nonce(record)
        .iter()
        .rev()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
    format!("{} nonce={nonce}", hex::encode(layout.digest(record)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_sixteen_bytes() {
        let layout = RecordLayout::default();
        assert_eq!(layout.record_len(), 16);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn layout_rejects_empty_and_oversized_fields() {
        assert!(RecordLayout::new(0, 6).validate().is_err());
        assert!(RecordLayout::new(10, 0).validate().is_err());
        assert!(RecordLayout::new(MAX_DIGEST_LEN + 1, 6).validate().is_err());
        assert!(RecordLayout::new(10, MAX_NONCE_LEN + 1).validate().is_err());
    }

    #[test]
    fn batch_splits_digest_and_nonce() {
        let layout = RecordLayout::new(2, 3);
        let mut batch = RecordBatch::new(layout);
        batch.push(&[1, 2, 3, 4, 5]);
        batch.push(&[6, 7, 8, 9, 10]);

        assert_eq!(batch.len(), 2);
        let second = batch.get(1).unwrap();
        assert_eq!(layout.digest(second), &[6, 7]);
        assert_eq!(layout.nonce(second), &[8, 9, 10]);
        assert!(batch.get(2).is_none());
    }

    #[test]
    fn from_bytes_requires_whole_records() {
        let layout = RecordLayout::new(2, 2);
        assert!(RecordBatch::from_bytes(layout, vec![0; 8]).is_ok());
        assert!(RecordBatch::from_bytes(layout, vec![0; 7]).is_err());
    }

    #[test]
    fn format_reads_nonce_little_endian() {
        let layout = RecordLayout::new(2, 2);
        assert_eq!(format_record(layout, &[0xab, 0x01, 0x01, 0x02]), "ab01 nonce=513");
    }
}
