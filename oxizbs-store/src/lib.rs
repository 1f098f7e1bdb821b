//! # OxiZBS Store
//!
//! Immutable, addressable, random-access containers of byte records:
//!
//! - [`zero_len`]: every record empty
//! - [`plain`]: raw concatenation + bit-packed offsets
//! - [`zip_offset`]: raw concatenation + block-compressed offsets,
//!   optional per-record CRC trailers
//! - [`mixed_len`]: fixed-stride packing for the dominant record length
//! - [`entropy_zip`]: whole-corpus Huffman with bit-aligned records
//! - [`dict_zip`]: global-dictionary LZ compression with an optional
//!   entropy second pass — the heavyweight of the family
//! - [`lru_cache`]: sharded page cache for fd-backed reads
//! - [`run_once`]: submit-else-inline task pool
//! - [`reorder_map`]: run-length encoded permutation files
//! - [`nest_trie`]: contract for trie-backed stores
//!
//! Every store serializes to one contiguous file: 128-byte header,
//! 16-byte-aligned payload blocks, 64-byte footer carrying a seeded XXH64
//! of everything before it. [`store::load_from_file`] dispatches on the
//! class name in the header.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod dict_zip;
pub mod entropy_zip;
pub mod env;
pub mod format;
pub mod lru_cache;
pub mod mixed_len;
pub mod nest_trie;
pub mod plain;
pub mod reorder_map;
pub mod run_once;
pub mod store;
pub mod zero_len;
pub mod zip_offset;

pub use dict_zip::{DictZipBuilder, DictZipOptions, DictZipStore};
pub use entropy_zip::{EntropyZipBuilder, EntropyZipOptions, EntropyZipStore};
pub use lru_cache::{LruPageCache, PAGE_SIZE};
pub use mixed_len::{MixedLenBuilder, MixedLenOptions, MixedLenStore};
pub use plain::{PlainBuilder, PlainStore};
pub use reorder_map::{ReorderMap, ReorderMapBuilder};
pub use run_once::{RunOncePool, TaskChain};
pub use store::{
    BlobStore, CacheOffsets, FdSource, RecordSource, StoreRegistry, global_registry,
    load_from_bytes, load_from_file,
};
pub use zero_len::{ZeroLenBuilder, ZeroLenStore};
pub use zip_offset::{ZipOffsetBuilder, ZipOffsetOptions, ZipOffsetStore};
