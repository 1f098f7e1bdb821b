//! # OxiZBS Entropy
//!
//! Entropy codecs for the OxiZBS blob-store workspace:
//!
//! - [`huffman`]: canonical Huffman, order-0 and order-1, 12-bit-capped
//!   codes, 1/2/4/8-way interleaved decoding
//! - [`rans`]: 64-bit range ANS, order-0/1/2, 1/2/4/8-way parallel streams
//!   with self-describing width framing
//!
//! Both codecs consume the histograms and bit I/O of `oxizbs-core`; the
//! blob-store crate layers whole-corpus compression on top of them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod huffman;
pub mod rans;

pub use huffman::{HuffmanDecoder, HuffmanDecoderO1, HuffmanEncoder, HuffmanEncoderO1};
pub use rans::{
    RansDecoder, RansDecoderO1, RansDecoderO2, RansEncoder, RansEncoderO1, RansEncoderO2,
};
