//! Framed log segments holding serialized page operations.
//!
//! ```text
//! segment = "CLRW" version:u16 reserved:u16 frame*
//! frame   = kind:u8 len:u32 body[len] crc32:u32
//! ```
//!
//! `body` is the record produced by [`PageOperation::to_stream`]; the CRC
//! covers the kind, the length and the body.

use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::options::CellarOptions;
use crate::primitives::bytes::le;
use crate::primitives::cache::CacheEntry;
use crate::types::checksum::frame_crc32;
use crate::types::{CellarError, Result};
use crate::wal::po::{OperationKind, PageOperation};

const SEGMENT_MAGIC: [u8; 4] = *b"CLRW";
const SEGMENT_VERSION: u16 = 1;
/// Bytes preceding the first frame.
pub const SEGMENT_HEADER_LEN: usize = 8;
/// Bytes a frame adds around its body.
pub const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Accumulates page operations into an in-memory segment.
#[derive(Debug)]
pub struct LogSegmentWriter {
    buf: BytesMut,
    records: usize,
}

impl Default for LogSegmentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSegmentWriter {
    /// Starts an empty segment.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(4096);
        buf.put_slice(&SEGMENT_MAGIC);
        buf.put_u16_le(SEGMENT_VERSION);
        buf.put_u16_le(0);
        Self { buf, records: 0 }
    }

    /// Appends one record.
    pub fn append(&mut self, op: &PageOperation) {
        let kind = op.kind().as_u8();
        let len = op.serialized_size();
        self.buf.reserve(FRAME_OVERHEAD + len);
        self.buf.put_u8(kind);
        self.buf.put_u32_le(len as u32);
        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        let end = op.to_stream(&mut self.buf[start..], 0);
        debug_assert_eq!(end, len);
        let crc = frame_crc32(kind, &self.buf[start..]);
        self.buf.put_u32_le(crc);
        self.records += 1;
        trace!(kind = ?op.kind(), len, "segment.append");
    }

    /// Appends records in order.
    pub fn append_all<'a, I>(&mut self, ops: I)
    where
        I: IntoIterator<Item = &'a PageOperation>,
    {
        for op in ops {
            self.append(op);
        }
    }

    /// Moves the pending records of `entry` into the segment.
    pub fn drain_entry(&mut self, entry: &mut CacheEntry) -> usize {
        let ops = entry.take_page_operations();
        self.append_all(&ops);
        debug!(
            file = %entry.file_id(),
            page = %entry.page_index(),
            records = ops.len(),
            "segment.drain_entry"
        );
        ops.len()
    }

    /// Records appended so far.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Encoded length including the header.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no record has been appended.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Encoded bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Writes the segment to `out`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.buf)?;
        out.flush()?;
        Ok(())
    }

    /// Freezes the segment.
    pub fn finish(self) -> Bytes {
        debug!(records = self.records, bytes = self.buf.len(), "segment.finish");
        self.buf.freeze()
    }
}

/// Iterates the records of an encoded segment.
///
/// Yields an error for the first bad frame and then stops.
pub struct LogSegmentReader<'a> {
    data: &'a [u8],
    off: usize,
    verify: bool,
    done: bool,
}

impl<'a> LogSegmentReader<'a> {
    /// Opens a segment, verifying frame checksums.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        Self::with_verification(data, true)
    }

    /// Opens a segment using the checksum policy from `options`.
    pub fn with_options(data: &'a [u8], options: &CellarOptions) -> Result<Self> {
        Self::with_verification(data, options.verify_log_checksums)
    }

    fn with_verification(data: &'a [u8], verify: bool) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_LEN {
            return Err(CellarError::Truncated {
                needed: SEGMENT_HEADER_LEN,
                offset: 0,
                available: data.len(),
            });
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(CellarError::Corruption("log segment magic mismatch"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SEGMENT_VERSION {
            return Err(CellarError::Corruption("unsupported log segment version"));
        }
        Ok(Self {
            data,
            off: SEGMENT_HEADER_LEN,
            verify,
            done: false,
        })
    }

    /// Offset of the next frame.
    pub fn position(&self) -> usize {
        self.off
    }

    fn need(&self, needed: usize) -> Result<()> {
        let available = self.data.len() - self.off;
        if available < needed {
            return Err(CellarError::Truncated {
                needed,
                offset: self.off,
                available,
            });
        }
        Ok(())
    }

    fn next_record(&mut self) -> Result<PageOperation> {
        self.need(5)?;
        let tag = le::get_u8(self.data, self.off);
        let len = le::get_u32(self.data, self.off + 1) as usize;
        self.need(FRAME_OVERHEAD + len)?;
        let body_at = self.off + 5;
        let body = &self.data[body_at..body_at + len];
        if self.verify {
            let stored = le::get_u32(self.data, body_at + len);
            if stored != frame_crc32(tag, body) {
                return Err(CellarError::Corruption("log frame crc mismatch"));
            }
        }
        let kind = OperationKind::try_from(tag)?;
        let (op, end) = PageOperation::from_stream(kind, body, 0)?;
        if end != len {
            return Err(CellarError::Corruption("log frame length disagrees with record"));
        }
        self.off = body_at + len + 4;
        Ok(op)
    }

    /// Decodes every record, failing on the first bad frame.
    pub fn read_all(self) -> Result<Vec<PageOperation>> {
        self.collect()
    }
}

impl Iterator for LogSegmentReader<'_> {
    type Item = Result<PageOperation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.off == self.data.len() {
            return None;
        }
        let item = self.next_record();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, OperationUnitId, PageIndex, RecordId};
    use crate::wal::delta::PageDelta;
    use crate::wal::po::PageOperationBody;

    fn sample() -> Vec<PageOperation> {
        let before = vec![0u8; 64];
        let mut after = before.clone();
        after[40..44].copy_from_slice(&[1, 2, 3, 4]);
        vec![
            PageOperation::with_envelope(
                FileId(3),
                PageIndex(7),
                OperationUnitId(11),
                PageOperationBody::BucketSetRightSibling { old: -1, new: 8 },
            ),
            PageOperation::with_envelope(
                FileId(3),
                PageIndex(7),
                OperationUnitId(11),
                PageOperationBody::BucketUpdateValue {
                    index: 0,
                    key_size: 4,
                    old: RecordId::new(1, 1),
                    new: RecordId::new(2, 2),
                },
            ),
            PageOperation::with_envelope(
                FileId(3),
                PageIndex(8),
                OperationUnitId(12),
                PageOperationBody::BucketAddLeafEntry {
                    index: 0,
                    entry_size: 16,
                    delta: PageDelta::between(&before, &after, 0),
                },
            ),
        ]
    }

    #[test]
    fn writer_reader_roundtrip() {
        let ops = sample();
        let mut writer = LogSegmentWriter::new();
        assert!(writer.is_empty());
        writer.append_all(&ops);
        assert_eq!(writer.record_count(), 3);
        let bytes = writer.finish();
        assert_eq!(&bytes[0..4], b"CLRW");

        let decoded = LogSegmentReader::new(&bytes).unwrap().read_all().unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn empty_segment_yields_nothing() {
        let bytes = LogSegmentWriter::new().finish();
        assert_eq!(bytes.len(), SEGMENT_HEADER_LEN);
        assert_eq!(LogSegmentReader::new(&bytes).unwrap().count(), 0);
    }

    #[test]
    fn flipped_body_byte_fails_crc() {
        let mut writer = LogSegmentWriter::new();
        writer.append_all(&sample());
        let mut bytes = writer.finish().to_vec();
        bytes[SEGMENT_HEADER_LEN + 5 + 2] ^= 0xFF;

        let mut reader = LogSegmentReader::new(&bytes).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(CellarError::Corruption("log frame crc mismatch")))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn unverified_reader_skips_crc_check() {
        let mut writer = LogSegmentWriter::new();
        writer.append(&sample()[0]);
        let mut bytes = writer.finish().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let options = CellarOptions {
            verify_log_checksums: false,
            ..CellarOptions::default()
        };
        let ops = LogSegmentReader::with_options(&bytes, &options)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert!(LogSegmentReader::new(&bytes).unwrap().read_all().is_err());
    }

    #[test]
    fn torn_tail_is_truncation() {
        let mut writer = LogSegmentWriter::new();
        writer.append_all(&sample());
        let bytes = writer.finish();
        let torn = &bytes[..bytes.len() - 6];

        let results: Vec<_> = LogSegmentReader::new(torn).unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(CellarError::Truncated { .. })));
    }

    #[test]
    fn bad_header_is_rejected() {
        assert!(matches!(
            LogSegmentReader::new(b"CLR"),
            Err(CellarError::Truncated { .. })
        ));
        assert!(matches!(
            LogSegmentReader::new(b"XXXX\x01\x00\x00\x00"),
            Err(CellarError::Corruption(_))
        ));
        assert!(matches!(
            LogSegmentReader::new(b"CLRW\x09\x00\x00\x00"),
            Err(CellarError::Corruption(_))
        ));
    }

    #[test]
    fn unknown_kind_surfaces_as_error() {
        let mut writer = LogSegmentWriter::new();
        writer.append(&sample()[0]);
        let mut bytes = writer.finish().to_vec();
        bytes[SEGMENT_HEADER_LEN] = 250;
        let options = CellarOptions {
            verify_log_checksums: false,
            ..CellarOptions::default()
        };
        let mut reader = LogSegmentReader::with_options(&bytes, &options).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(CellarError::UnknownOperation(250)))
        ));
    }
}
