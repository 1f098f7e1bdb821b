//! # OxiZBS Core
//!
//! Foundation crate for the OxiZBS blob-store workspace.
//!
//! - [`bits`]: reverse bit writer / forward bit reader shared by the
//!   Huffman and rANS codecs
//! - [`hist`]: order-0/1/2 byte-frequency histograms with normalisation
//! - [`crc`]: CRC-32C and CRC-16 for header and record protection
//! - [`xxh`]: seeded XXH64 helpers and the checksum-verification switch
//! - [`uint_vec`]: bit-packed integer vectors (offset indexes)
//! - [`sorted_uint_vec`]: block-compressed monotone sequences
//! - [`rank_select`]: bitmaps with O(1) rank
//! - [`mem`]: owned backing memory (mmap or heap) for loaded stores
//! - [`error`]: the shared error type
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ oxizbs-store: blob store containers, page cache      │
//! ├──────────────────────────────────────────────────────┤
//! │ oxizbs-entropy: Huffman + rANS codecs                │
//! ├──────────────────────────────────────────────────────┤
//! │ oxizbs-core (this crate): bits, histograms, CRC,     │
//! │ succinct vectors, mmap                               │
//! └──────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bits;
pub mod crc;
pub mod error;
pub mod hist;
pub mod mem;
pub mod rank_select;
pub mod sorted_uint_vec;
pub mod uint_vec;
pub mod xxh;

pub use bits::{BitReader, EntropyBits, EntropyBitsOwned, ReverseBitWriter, bytes_to_bits};
pub use crc::{Crc16, Crc32c};
pub use error::{Error, Result};
pub use hist::{FreqHist, FreqHistO1, FreqHistO2, Histogram, HistogramO1, HistogramO2};
pub use mem::StoreMem;
pub use rank_select::{BitVec, RankSelect};
pub use sorted_uint_vec::{SortedUintVecView, SortedVecCache, build_sorted_uints};
pub use uint_vec::{UintVecBuilder, UintVecView, compute_mem_size, pack_uints, uint_bits};
pub use xxh::{Xxh64Stream, checksum_verify_enabled, set_checksum_verify, xxhash64};
