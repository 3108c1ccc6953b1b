//! Before/after images of the byte ranges a page mutation changed.
//!
//! Structural bucket mutations (slot shifts, compaction) touch bytes that are
//! tedious to describe field by field. Instead the mutator snapshots the
//! windows it may write, performs the change, and keeps only the spans that
//! actually differ. Redo copies the `after` images back, undo the `before`
//! images, so recovery never re-runs tree logic.

use std::ops::Range;

use smallvec::SmallVec;

use crate::primitives::bytes::buf::{Cursor, Writer};
use crate::types::{CellarError, Result};

/// Unchanged bytes tolerated inside one span before a new span is started.
pub const DEFAULT_DELTA_MERGE_GAP: usize = 8;

const SPAN_HEADER_LEN: usize = 8;

/// One contiguous changed region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaSpan {
    /// Absolute page offset of the first byte.
    pub offset: u32,
    /// Bytes before the mutation.
    pub before: Vec<u8>,
    /// Bytes after the mutation.
    pub after: Vec<u8>,
}

impl DeltaSpan {
    fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.before.len()
    }
}

/// Ordered, non-overlapping set of changed spans.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageDelta {
    spans: SmallVec<[DeltaSpan; 2]>,
}

impl PageDelta {
    /// Diffs two whole page images.
    pub fn between(before: &[u8], after: &[u8], merge_gap: usize) -> Self {
        assert_eq!(before.len(), after.len(), "page images differ in size");
        let mut delta = Self::default();
        delta.push_window(0, before, after, merge_gap);
        delta
    }

    fn push_window(&mut self, base: usize, before: &[u8], after: &[u8], merge_gap: usize) {
        let mut run: Option<(usize, usize)> = None;
        for (i, (b, a)) in before.iter().zip(after).enumerate() {
            if b == a {
                continue;
            }
            run = match run {
                Some((start, last)) if i - last - 1 <= merge_gap => Some((start, i)),
                Some((start, last)) => {
                    self.push_span(base, start..last + 1, before, after);
                    Some((i, i))
                }
                None => Some((i, i)),
            };
        }
        if let Some((start, last)) = run {
            self.push_span(base, start..last + 1, before, after);
        }
    }

    fn push_span(&mut self, base: usize, local: Range<usize>, before: &[u8], after: &[u8]) {
        self.spans.push(DeltaSpan {
            offset: (base + local.start) as u32,
            before: before[local.clone()].to_vec(),
            after: after[local].to_vec(),
        });
    }

    /// Changed spans in ascending offset order.
    pub fn spans(&self) -> &[DeltaSpan] {
        &self.spans
    }

    /// True when the mutation left the page untouched.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total bytes covered by all spans.
    pub fn changed_bytes(&self) -> usize {
        self.spans.iter().map(|s| s.before.len()).sum()
    }

    /// Writes every `after` image into `page`.
    pub fn apply_after(&self, page: &mut [u8]) -> Result<()> {
        self.check_bounds(page.len())?;
        for span in &self.spans {
            page[span.range()].copy_from_slice(&span.after);
        }
        Ok(())
    }

    /// Writes every `before` image into `page`, last span first.
    pub fn apply_before(&self, page: &mut [u8]) -> Result<()> {
        self.check_bounds(page.len())?;
        for span in self.spans.iter().rev() {
            page[span.range()].copy_from_slice(&span.before);
        }
        Ok(())
    }

    fn check_bounds(&self, page_len: usize) -> Result<()> {
        for span in &self.spans {
            if span.before.len() != span.after.len() {
                return Err(CellarError::Corruption("delta span images differ in length"));
            }
            if span.range().end > page_len {
                return Err(CellarError::Corruption("delta span beyond page"));
            }
        }
        Ok(())
    }

    /// Encoded size: `[count:4]` then `[offset:4][len:4][before][after]` per span.
    pub fn serialized_size(&self) -> usize {
        4 + self
            .spans
            .iter()
            .map(|s| SPAN_HEADER_LEN + 2 * s.before.len())
            .sum::<usize>()
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) {
        w.put_u32(self.spans.len() as u32);
        for span in &self.spans {
            w.put_u32(span.offset);
            w.put_u32(span.before.len() as u32);
            w.put(&span.before);
            w.put(&span.after);
        }
    }

    pub(crate) fn read(cur: &mut Cursor<'_>) -> Result<Self> {
        let count = cur.read_u32()? as usize;
        // each span carries at least its header
        if count.saturating_mul(SPAN_HEADER_LEN) > cur.remaining() {
            return Err(CellarError::Truncated {
                needed: count.saturating_mul(SPAN_HEADER_LEN),
                offset: cur.off,
                available: cur.remaining(),
            });
        }
        let mut spans = SmallVec::with_capacity(count);
        let mut prev_end = 0usize;
        for _ in 0..count {
            let offset = cur.read_u32()?;
            let len = cur.read_u32()? as usize;
            let before = cur.take(len)?.to_vec();
            let after = cur.take(len)?.to_vec();
            let span = DeltaSpan {
                offset,
                before,
                after,
            };
            if span.range().start < prev_end {
                return Err(CellarError::Corruption("delta spans overlap or are unordered"));
            }
            prev_end = span.range().end;
            spans.push(span);
        }
        Ok(Self { spans })
    }
}

/// Copies of the page windows a mutation is about to write.
pub struct PageSnapshot {
    windows: SmallVec<[(usize, Box<[u8]>); 2]>,
}

impl PageSnapshot {
    /// Captures `windows` of `page`; overlapping or touching windows are merged.
    pub fn capture(page: &[u8], windows: &[Range<usize>]) -> Self {
        let mut ranges: SmallVec<[Range<usize>; 2]> = windows
            .iter()
            .filter(|r| r.start < r.end)
            .cloned()
            .collect();
        ranges.sort_unstable_by_key(|r| r.start);
        let mut merged: SmallVec<[Range<usize>; 2]> = SmallVec::new();
        for range in ranges {
            assert!(
                range.end <= page.len(),
                "snapshot window {:?} outside page of {} bytes",
                range,
                page.len()
            );
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        Self {
            windows: merged
                .into_iter()
                .map(|r| (r.start, page[r].to_vec().into_boxed_slice()))
                .collect(),
        }
    }

    /// Diffs the captured windows against the current page contents.
    pub fn diff(&self, page: &[u8], merge_gap: usize) -> PageDelta {
        let mut delta = PageDelta::default();
        for (start, before) in &self.windows {
            let after = &page[*start..*start + before.len()];
            delta.push_window(*start, before, after, merge_gap);
        }
        delta
    }

    /// Number of bytes held by the snapshot.
    pub fn captured_bytes(&self) -> usize {
        self.windows.iter().map(|(_, w)| w.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nearby_changes_share_a_span() {
        let before = vec![0u8; 64];
        let mut after = before.clone();
        after[10] = 1;
        after[14] = 2;
        after[40] = 3;
        let delta = PageDelta::between(&before, &after, 4);
        assert_eq!(delta.spans().len(), 2);
        assert_eq!(delta.spans()[0].offset, 10);
        assert_eq!(delta.spans()[0].after, vec![1, 0, 0, 0, 2]);
        assert_eq!(delta.spans()[1].offset, 40);
        assert_eq!(delta.changed_bytes(), 6);
    }

    #[test]
    fn zero_gap_splits_every_run() {
        let before = vec![0u8; 8];
        let after = vec![1u8, 0, 1, 1, 0, 0, 0, 1];
        let delta = PageDelta::between(&before, &after, 0);
        let offsets: Vec<u32> = delta.spans().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 2, 7]);
    }

    #[test]
    fn snapshot_merges_overlapping_windows() {
        let mut page = vec![0u8; 32];
        let snap = PageSnapshot::capture(&page, &[4..10, 8..16, 20..20, 24..32]);
        assert_eq!(snap.captured_bytes(), 12 + 8);
        page[9] = 7;
        page[30] = 9;
        let delta = snap.diff(&page, 8);
        assert_eq!(delta.spans().len(), 2);
        assert_eq!(delta.spans()[0].offset, 9);
        assert_eq!(delta.spans()[1].offset, 30);
    }

    #[test]
    fn apply_rejects_out_of_page_span() {
        let before = vec![0u8; 16];
        let mut after = before.clone();
        after[15] = 1;
        let delta = PageDelta::between(&before, &after, 0);
        let mut small = vec![0u8; 8];
        let err = delta.apply_after(&mut small).unwrap_err();
        assert!(matches!(err, CellarError::Corruption(_)));
    }

    #[test]
    fn read_rejects_overlapping_spans() {
        let mut stream = vec![0u8; 4 + 2 * (8 + 2)];
        {
            let mut w = Writer::at(&mut stream, 0);
            w.put_u32(2);
            w.put_u32(4);
            w.put_u32(1);
            w.put(&[0, 1]);
            w.put_u32(4);
            w.put_u32(1);
            w.put(&[0, 1]);
        }
        let mut cur = Cursor::at(&stream, 0);
        assert!(matches!(
            PageDelta::read(&mut cur),
            Err(CellarError::Corruption(_))
        ));
    }

    proptest! {
        #[test]
        fn apply_after_and_before_restore_images(
            base in proptest::collection::vec(any::<u8>(), 1..256),
            edits in proptest::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 0..32),
            gap in 0usize..16,
        ) {
            let before = base.clone();
            let mut after = base;
            for (idx, value) in edits {
                let i = idx.index(after.len());
                after[i] = value;
            }
            let delta = PageDelta::between(&before, &after, gap);

            let mut page = before.clone();
            delta.apply_after(&mut page).unwrap();
            prop_assert_eq!(&page, &after);
            delta.apply_before(&mut page).unwrap();
            prop_assert_eq!(&page, &before);

            let mut stream = vec![0u8; delta.serialized_size()];
            let mut w = Writer::at(&mut stream, 0);
            delta.write(&mut w);
            prop_assert_eq!(w.position(), stream.len());
            let mut cur = Cursor::at(&stream, 0);
            prop_assert_eq!(PageDelta::read(&mut cur).unwrap(), delta);
        }
    }
}
