#![forbid(unsafe_code)]
//! Fixed-width field codecs and stream cursors shared by pages and log records.

pub mod le {
    //! Little-endian field access at explicit offsets.
    //!
    //! Offsets are trusted: an access past the end of the slice is a logic
    //! error upstream and panics with the offending range.

    use core::convert::TryInto;

    #[inline]
    fn window(src: &[u8], offset: usize, len: usize) -> &[u8] {
        let end = offset
            .checked_add(len)
            .unwrap_or_else(|| panic!("field offset overflow at {offset}"));
        src.get(offset..end).unwrap_or_else(|| {
            panic!(
                "field {}..{} outside buffer of {} bytes",
                offset,
                end,
                src.len()
            )
        })
    }

    #[inline]
    fn window_mut(dst: &mut [u8], offset: usize, len: usize) -> &mut [u8] {
        let dst_len = dst.len();
        let end = offset
            .checked_add(len)
            .unwrap_or_else(|| panic!("field offset overflow at {offset}"));
        dst.get_mut(offset..end).unwrap_or_else(|| {
            panic!("field {offset}..{end} outside buffer of {dst_len} bytes")
        })
    }

    /// Reads one byte.
    pub fn get_u8(src: &[u8], offset: usize) -> u8 {
        window(src, offset, 1)[0]
    }

    /// Writes one byte.
    pub fn put_u8(dst: &mut [u8], offset: usize, v: u8) {
        window_mut(dst, offset, 1)[0] = v;
    }

    /// Reads a little-endian `i16`.
    pub fn get_i16(src: &[u8], offset: usize) -> i16 {
        i16::from_le_bytes(window(src, offset, 2).try_into().unwrap())
    }

    /// Writes a little-endian `i16`.
    pub fn put_i16(dst: &mut [u8], offset: usize, v: i16) {
        window_mut(dst, offset, 2).copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a little-endian `i32`.
    pub fn get_i32(src: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes(window(src, offset, 4).try_into().unwrap())
    }

    /// Writes a little-endian `i32`.
    pub fn put_i32(dst: &mut [u8], offset: usize, v: i32) {
        window_mut(dst, offset, 4).copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a little-endian `u32`.
    pub fn get_u32(src: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(window(src, offset, 4).try_into().unwrap())
    }

    /// Writes a little-endian `u32`.
    pub fn put_u32(dst: &mut [u8], offset: usize, v: u32) {
        window_mut(dst, offset, 4).copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a little-endian `i64`.
    pub fn get_i64(src: &[u8], offset: usize) -> i64 {
        i64::from_le_bytes(window(src, offset, 8).try_into().unwrap())
    }

    /// Writes a little-endian `i64`.
    pub fn put_i64(dst: &mut [u8], offset: usize, v: i64) {
        window_mut(dst, offset, 8).copy_from_slice(&v.to_le_bytes());
    }

    /// Borrows `len` bytes starting at `offset`.
    pub fn get_bytes(src: &[u8], offset: usize, len: usize) -> &[u8] {
        window(src, offset, len)
    }

    /// Copies `bytes` into `dst` at `offset`.
    pub fn put_bytes(dst: &mut [u8], offset: usize, bytes: &[u8]) {
        window_mut(dst, offset, bytes.len()).copy_from_slice(bytes);
    }
}

pub mod buf {
    //! Slice-backed cursors for encoding and decoding record streams.

    use core::convert::TryInto;
    use core::fmt;

    use crate::types::{CellarError, Result};

    /// Bounds-checked reader; running past the end yields [`CellarError::Truncated`].
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a cursor positioned at `off`.
        pub fn at(buf: &'a [u8], off: usize) -> Self {
            Self { buf, off }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self.off.checked_add(n).ok_or(CellarError::Truncated {
                needed: n,
                offset: self.off,
                available: self.remaining(),
            })?;
            if end > self.buf.len() {
                return Err(CellarError::Truncated {
                    needed: n,
                    offset: self.off,
                    available: self.remaining(),
                });
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn read_u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a little-endian `i16`.
        pub fn read_i16(&mut self) -> Result<i16> {
            Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
        }

        /// Reads a little-endian `i32`.
        pub fn read_i32(&mut self) -> Result<i32> {
            Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
        }

        /// Reads a little-endian `u32`.
        pub fn read_u32(&mut self) -> Result<u32> {
            Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
        }

        /// Reads a little-endian `i64`.
        pub fn read_i64(&mut self) -> Result<i64> {
            Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
        }

        /// Reads a little-endian `u64`.
        pub fn read_u64(&mut self) -> Result<u64> {
            Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }

    /// Writer over a pre-sized destination.
    ///
    /// Callers size the destination from `serialized_size`, so overrunning it
    /// is a logic error and panics.
    pub struct Writer<'a> {
        buf: &'a mut [u8],
        off: usize,
    }

    impl<'a> Writer<'a> {
        /// Creates a writer positioned at `off`.
        pub fn at(buf: &'a mut [u8], off: usize) -> Self {
            Self { buf, off }
        }

        /// Appends raw bytes.
        pub fn put(&mut self, bytes: &[u8]) {
            let end = self.off + bytes.len();
            assert!(
                end <= self.buf.len(),
                "stream writer overrun: need {} bytes at {}, have {}",
                bytes.len(),
                self.off,
                self.buf.len().saturating_sub(self.off)
            );
            self.buf[self.off..end].copy_from_slice(bytes);
            self.off = end;
        }

        /// Appends one byte.
        pub fn put_u8(&mut self, v: u8) {
            self.put(&[v]);
        }

        /// Appends a little-endian `i16`.
        pub fn put_i16(&mut self, v: i16) {
            self.put(&v.to_le_bytes());
        }

        /// Appends a little-endian `i32`.
        pub fn put_i32(&mut self, v: i32) {
            self.put(&v.to_le_bytes());
        }

        /// Appends a little-endian `u32`.
        pub fn put_u32(&mut self, v: u32) {
            self.put(&v.to_le_bytes());
        }

        /// Appends a little-endian `i64`.
        pub fn put_i64(&mut self, v: i64) {
            self.put(&v.to_le_bytes());
        }

        /// Appends a little-endian `u64`.
        pub fn put_u64(&mut self, v: u64) {
            self.put(&v.to_le_bytes());
        }

        /// Current write offset.
        pub fn position(&self) -> usize {
            self.off
        }
    }
}
