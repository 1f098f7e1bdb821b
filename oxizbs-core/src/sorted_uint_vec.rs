//! Block-compressed monotone integer sequences.
//!
//! A `SortedUintVec` stores a non-decreasing sequence in blocks of 64 or 128
//! values. Each block records its first value (the base), a per-block delta
//! width, and the payload bit offset, so `get2` costs one index probe plus
//! two delta reads. Iteration-heavy callers keep a [`SortedVecCache`] of the
//! last decoded block: sequential record scans then decompress each block
//! once instead of once per record.
//!
//! Serialized layout (all little-endian):
//!
//! ```text
//! [len u64][log2_units u8][base_bits u8][offset_bits u8][pad u8;5]
//! [index: per block (base | payload_bit_off | width:6), bit packed]
//! [payload: per block, deltas from the block base, width bits each]
//! ```

use crate::uint_vec::{get_bits, put_bits, uint_bits};

/// Largest supported block: 128 values plus the next block's first value.
pub const MAX_BLOCK_UNITS: usize = 128;

const HEADER_BYTES: usize = 16;

/// Per-caller cache of one decoded block.
pub struct SortedVecCache {
    /// Decoded block id, `usize::MAX` when the cache is empty.
    pub block_id: usize,
    /// Decoded values; `offsets[units]` holds the next block's first value.
    pub offsets: [u64; MAX_BLOCK_UNITS + 1],
    /// Number of valid entries in `offsets`.
    pub count: usize,
}

impl Default for SortedVecCache {
    fn default() -> Self {
        Self {
            block_id: usize::MAX,
            offsets: [0; MAX_BLOCK_UNITS + 1],
            count: 0,
        }
    }
}

impl SortedVecCache {
    /// Drop the cached block.
    pub fn invalidate(&mut self) {
        self.block_id = usize::MAX;
        self.count = 0;
    }
}

/// Serialize a monotone sequence with the given block size log2 (6 or 7).
pub fn build_sorted_uints(values: &[u64], log2_units: u8) -> Vec<u8> {
    assert!(log2_units == 6 || log2_units == 7);
    debug_assert!(values.windows(2).all(|w| w[0] <= w[1]));
    let units = 1usize << log2_units;
    let num_blocks = values.len().div_ceil(units);
    let mut widths = Vec::with_capacity(num_blocks);
    let mut payload_bits = 0u64;
    let mut max_base = 0u64;
    for b in 0..num_blocks {
        let lo = b * units;
        let hi = (lo + units).min(values.len());
        let base = values[lo];
        max_base = max_base.max(base);
        let w = uint_bits(values[hi - 1] - base);
        widths.push(w);
        payload_bits += (w * (hi - lo)) as u64;
    }
    let base_bits = uint_bits(max_base);
    let offset_bits = uint_bits(payload_bits);
    let entry_bits = base_bits + offset_bits + 6;

    let mut out = Vec::new();
    out.extend_from_slice(&(values.len() as u64).to_le_bytes());
    out.push(log2_units);
    out.push(base_bits as u8);
    out.push(offset_bits as u8);
    out.extend_from_slice(&[0u8; 5]);

    let index_bytes = (entry_bits * num_blocks).div_ceil(64) * 8;
    let mut index = vec![0u8; index_bytes];
    let mut payload = vec![0u8; (payload_bits as usize).div_ceil(64) * 8];
    let mut bit_off = 0u64;
    for b in 0..num_blocks {
        let lo = b * units;
        let hi = (lo + units).min(values.len());
        let base = values[lo];
        let w = widths[b];
        let at = b * entry_bits;
        put_bits(&mut index, at, base, base_bits);
        put_bits(&mut index, at + base_bits, bit_off, offset_bits);
        put_bits(&mut index, at + base_bits + offset_bits, w as u64, 6);
        for (k, &v) in values[lo..hi].iter().enumerate() {
            put_bits(&mut payload, bit_off as usize + k * w, v - base, w);
        }
        bit_off += (w * (hi - lo)) as u64;
    }
    out.extend_from_slice(&index);
    out.extend_from_slice(&payload);
    out
}

/// Borrowed view over a serialized `SortedUintVec`.
#[derive(Clone, Copy)]
pub struct SortedUintVecView<'a> {
    index: &'a [u8],
    payload: &'a [u8],
    len: usize,
    log2_units: u8,
    base_bits: usize,
    offset_bits: usize,
}

impl<'a> SortedUintVecView<'a> {
    /// Parse the serialized form.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_BYTES {
            return None;
        }
        let len = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        let log2_units = data[8];
        if log2_units != 6 && log2_units != 7 {
            return None;
        }
        let base_bits = data[9] as usize;
        let offset_bits = data[10] as usize;
        let units = 1usize << log2_units;
        let num_blocks = len.div_ceil(units);
        let entry_bits = base_bits + offset_bits + 6;
        let index_bytes = (entry_bits * num_blocks).div_ceil(64) * 8;
        if data.len() < HEADER_BYTES + index_bytes {
            return None;
        }
        Some(Self {
            index: &data[HEADER_BYTES..HEADER_BYTES + index_bytes],
            payload: &data[HEADER_BYTES + index_bytes..],
            len,
            log2_units,
            base_bits,
            offset_bits,
        })
    }

    /// Number of values.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the sequence is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block size log2 (6 or 7).
    #[inline]
    pub fn log2_block_units(&self) -> u8 {
        self.log2_units
    }

    #[inline]
    fn entry(&self, block: usize) -> (u64, u64, usize) {
        let at = block * (self.base_bits + self.offset_bits + 6);
        let base = get_bits(self.index, at, self.base_bits);
        let off = get_bits(self.index, at + self.base_bits, self.offset_bits);
        let width = get_bits(self.index, at + self.base_bits + self.offset_bits, 6) as usize;
        (base, off, width)
    }

    /// Read value `i`.
    pub fn get(&self, i: usize) -> u64 {
        debug_assert!(i < self.len);
        let units = 1usize << self.log2_units;
        let (base, off, width) = self.entry(i / units);
        base + get_bits(self.payload, off as usize + (i % units) * width, width)
    }

    /// Read the adjacent pair `(v[i], v[i+1])`.
    pub fn get2(&self, i: usize) -> (u64, u64) {
        debug_assert!(i + 1 < self.len);
        let units = 1usize << self.log2_units;
        let block = i / units;
        let (base, off, width) = self.entry(block);
        let a = base + get_bits(self.payload, off as usize + (i % units) * width, width);
        let b = if (i + 1) / units == block {
            base + get_bits(self.payload, off as usize + (i % units + 1) * width, width)
        } else {
            self.entry(block + 1).0
        };
        (a, b)
    }

    /// `get2` through a per-caller block cache.
    pub fn get2_cached(&self, i: usize, cache: &mut SortedVecCache) -> (u64, u64) {
        debug_assert!(i + 1 < self.len);
        let units = 1usize << self.log2_units;
        let block = i / units;
        if cache.block_id != block {
            let lo = block * units;
            let hi = (lo + units).min(self.len);
            let (base, off, width) = self.entry(block);
            for k in 0..(hi - lo) {
                cache.offsets[k] = base + get_bits(self.payload, off as usize + k * width, width);
            }
            let mut count = hi - lo;
            if hi < self.len {
                cache.offsets[count] = self.entry(block + 1).0;
                count += 1;
            }
            cache.block_id = block;
            cache.count = count;
        }
        let k = i % units;
        debug_assert!(k + 1 < cache.count);
        (cache.offsets[k], cache.offsets[k + 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Vec<u64> {
        let mut v = Vec::with_capacity(n);
        let mut x = 0u64;
        for i in 0..n {
            x += (i as u64 * 2654435761) % 97;
            v.push(x);
        }
        v
    }

    #[test]
    fn test_roundtrip_both_block_sizes() {
        for log2 in [6u8, 7] {
            for n in [0usize, 1, 2, 63, 64, 65, 127, 128, 129, 1000] {
                let values = sample(n);
                let bytes = build_sorted_uints(&values, log2);
                let view = SortedUintVecView::new(&bytes).unwrap();
                assert_eq!(view.len(), n);
                for (i, &v) in values.iter().enumerate() {
                    assert_eq!(view.get(i), v, "log2={log2} n={n} i={i}");
                }
                for i in 0..n.saturating_sub(1) {
                    assert_eq!(view.get2(i), (values[i], values[i + 1]));
                }
            }
        }
    }

    #[test]
    fn test_cached_matches_uncached() {
        let values = sample(700);
        let bytes = build_sorted_uints(&values, 7);
        let view = SortedUintVecView::new(&bytes).unwrap();
        let mut cache = SortedVecCache::default();
        for i in 0..values.len() - 1 {
            assert_eq!(view.get2_cached(i, &mut cache), view.get2(i));
        }
        // Random order also works through the cache.
        for &i in &[600usize, 3, 550, 4, 698, 0] {
            assert_eq!(view.get2_cached(i, &mut cache), view.get2(i));
        }
    }

    #[test]
    fn test_constant_sequence_is_tiny() {
        let values = vec![12345u64; 1000];
        let bytes = build_sorted_uints(&values, 7);
        let view = SortedUintVecView::new(&bytes).unwrap();
        assert_eq!(view.get2(500), (12345, 12345));
        // All-zero deltas pack to zero payload bits.
        assert!(bytes.len() < 200);
    }
}
