//! XXH64 helpers and the global checksum-verification switch.
//!
//! Every store file ends in a footer whose `file_xxhash` is the XXH64 of all
//! preceding bytes, seeded with a per-class constant so a file loaded under
//! the wrong class name fails its hash even when the layout happens to line
//! up.

use std::sync::atomic::{AtomicBool, Ordering};
use xxhash_rust::xxh64::{Xxh64, xxh64};

/// Seeds for the file-level XXH64, one per store class.
pub mod seed {
    /// Generic blob-store seed ("DictHash").
    pub const BLOB_STORE: u64 = 0x6873614874636944;
    /// Dictionary-zip store seed ("DZBSNARK").
    pub const DICT_ZIP: u64 = 0x4b52414e53425a44;
    /// Plain store seed ("PlainBBS").
    pub const PLAIN: u64 = 0x5342426e69616c50;
    /// Mixed-length store seed ("MixedLen").
    pub const MIXED_LEN: u64 = 0x6e654c646578694d;
    /// Entropy-zip store seed ("EtaZ_BBS").
    pub const ENTROPY_ZIP: u64 = 0x5342425f5a617445;
}

/// One-shot XXH64 with an explicit seed.
#[inline]
pub fn xxhash64(data: &[u8], seed: u64) -> u64 {
    xxh64(data, seed)
}

/// Streaming XXH64 used by store writers, so padding bytes are hashed
/// exactly as they hit the file.
pub struct Xxh64Stream {
    inner: Xxh64,
}

impl Xxh64Stream {
    /// Start a stream with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Xxh64::new(seed),
        }
    }

    /// Hash more bytes.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Current digest.
    #[inline]
    pub fn digest(&self) -> u64 {
        self.inner.digest()
    }
}

static CHECKSUM_VERIFY: AtomicBool = AtomicBool::new(true);

/// Whether load paths verify file hashes and CRCs. Defaults to on.
pub fn checksum_verify_enabled() -> bool {
    CHECKSUM_VERIFY.load(Ordering::Relaxed)
}

/// Toggle checksum verification process-wide.
pub fn set_checksum_verify(enabled: bool) {
    CHECKSUM_VERIFY.store(enabled, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_matches_oneshot() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i ^ (i >> 3)) as u8).collect();
        let mut s = Xxh64Stream::new(seed::DICT_ZIP);
        s.update(&data[..100]);
        s.update(&data[100..1000]);
        s.update(&data[1000..]);
        assert_eq!(s.digest(), xxhash64(&data, seed::DICT_ZIP));
    }

    #[test]
    fn test_seeds_differ() {
        let data = b"same bytes";
        assert_ne!(
            xxhash64(data, seed::PLAIN),
            xxhash64(data, seed::MIXED_LEN)
        );
    }
}
