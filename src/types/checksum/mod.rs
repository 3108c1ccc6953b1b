#![forbid(unsafe_code)]

/// Incremental checksum interface.
pub trait Checksum {
    /// Clears any accumulated state.
    fn reset(&mut self);
    /// Feeds `bytes` into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC-32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC of one log frame: covers the kind tag, the body length and the body.
pub fn frame_crc32(kind: u8, body: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&[kind]);
    hasher.update(&(body.len() as u32).to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}
