//! The blob-store contract and the class-name registry.
//!
//! A blob store is an immutable, random-access container of byte records.
//! Finalized stores are loaded from a single contiguous region (mmap or
//! caller memory) and are safe for concurrent reads.

use crate::format::HeaderBase;
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::sorted_uint_vec::SortedVecCache;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Per-iterator scratch: reused record buffer plus the last decoded offset
/// block, so sequential scans decompress each offset block once.
#[derive(Default)]
pub struct CacheOffsets {
    /// Decoded record bytes of the last `get_record_cached` call.
    pub rec_data: Vec<u8>,
    /// Cached offset block.
    pub block: SortedVecCache,
}

impl CacheOffsets {
    /// Drop the cached offset block (e.g. after switching stores).
    pub fn invalidate(&mut self) {
        self.block.invalidate();
    }
}

/// Caller-supplied byte source for reading record payload through a file
/// descriptor, page cache, or any other transport, instead of the store's
/// own mapping.
pub trait RecordSource {
    /// Read `len` bytes at absolute `offset`. `scratch` may back the
    /// returned slice; implementations returning views into their own
    /// buffers (e.g. a pinned cache page) may ignore it.
    fn read_at<'a>(&'a mut self, offset: u64, len: usize, scratch: &'a mut Vec<u8>)
    -> Result<&'a [u8]>;
}

/// A positioned file descriptor as a [`RecordSource`].
pub struct FdSource {
    fd: i32,
}

impl FdSource {
    /// Wrap a raw descriptor; the caller keeps ownership of the fd.
    pub fn new(fd: i32) -> Result<Self> {
        if fd < 0 {
            return Err(Error::invalid_argument(format!("bad fd {fd}")));
        }
        Ok(Self { fd })
    }
}

impl RecordSource for FdSource {
    fn read_at<'a>(
        &'a mut self,
        offset: u64,
        len: usize,
        scratch: &'a mut Vec<u8>,
    ) -> Result<&'a [u8]> {
        scratch.resize(len, 0);
        crate::lru_cache::fd_pread(self.fd, offset, scratch)?;
        Ok(&scratch[..])
    }
}

/// Common interface of every finalized store.
pub trait BlobStore: Send + Sync {
    /// Store class name as recorded in file headers.
    fn name(&self) -> &'static str;

    /// Number of records.
    fn num_records(&self) -> usize;

    /// Sum of uncompressed record lengths.
    fn total_data_size(&self) -> u64;

    /// Resident bytes referenced by this store.
    fn mem_size(&self) -> usize;

    /// Append record `id` to `out`.
    fn get_record_append(&self, id: usize, out: &mut Vec<u8>) -> Result<()>;

    /// Fetch record `id`.
    fn get_record(&self, id: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_record_append(id, &mut out)?;
        Ok(out)
    }

    /// Append record `id` through an iterator cache. Stores with block
    /// compressed offsets override this to reuse the decoded block.
    fn get_record_append_cached(&self, id: usize, co: &mut CacheOffsets) -> Result<()> {
        let mut out = std::mem::take(&mut co.rec_data);
        let r = self.get_record_append(id, &mut out);
        co.rec_data = out;
        r
    }

    /// Fetch record `id` through an iterator cache.
    fn get_record_cached(&self, id: usize, co: &mut CacheOffsets) -> Result<()> {
        co.rec_data.clear();
        self.get_record_append_cached(id, co)
    }

    /// Append record `id`, reading payload bytes through the page cache
    /// instead of this store's own mapping. `fi` names the file inside the
    /// cache; the store file starts at `base_offset` within it.
    fn pread_record_append(
        &self,
        cache: &crate::lru_cache::LruPageCache,
        fi: u32,
        base_offset: u64,
        id: usize,
        out: &mut Vec<u8>,
        rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        let mut src = crate::lru_cache::CachedSource::new(cache, fi, 0);
        self.fspread_record_append(&mut src, base_offset, id, out, rdbuf)
    }

    /// Append record `id`, fetching payload bytes through `src` where the
    /// store file begins at `base_offset` within the source.
    fn fspread_record_append(
        &self,
        _src: &mut dyn RecordSource,
        _base_offset: u64,
        _id: usize,
        _out: &mut Vec<u8>,
        _rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        Err(Error::not_implemented(format!(
            "{}: fspread_record_append",
            self.name()
        )))
    }

    /// Metadata blocks (index structures) as views into the loaded region.
    fn get_meta_blocks(&self) -> Vec<&[u8]>;

    /// Data blocks (payload) as views into the loaded region.
    fn get_data_blocks(&self) -> Vec<&[u8]>;

    /// Replace the metadata views with equivalent caller-owned copies so
    /// the backing mapping can be dropped or re-mapped.
    fn detach_meta_blocks(&mut self, _blocks: Vec<Vec<u8>>) -> Result<()> {
        Err(Error::not_implemented(format!(
            "{}: detach_meta_blocks",
            self.name()
        )))
    }

    /// Write a new store file whose record `i` holds this store's record
    /// `new_to_old[i]`. Record-level side data (checksums, entropy flags)
    /// is permuted identically.
    fn reorder_zip_data(
        &self,
        _new_to_old: &mut dyn Iterator<Item = usize>,
        _write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        Err(Error::not_implemented(format!(
            "{}: reorder_zip_data",
            self.name()
        )))
    }

    /// Write a new store file keeping only records for which `is_del`
    /// returns false, in order.
    fn purge_zip_data(
        &self,
        _is_del: &dyn Fn(usize) -> bool,
        _write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        Err(Error::not_implemented(format!(
            "{}: purge_zip_data",
            self.name()
        )))
    }
}

/// Loader signature registered per class name.
pub type LoaderFn = fn(StoreMem) -> Result<Box<dyn BlobStore>>;

/// Explicit class-name → loader table. A process-wide instance is created
/// lazily with the built-in stores registered; embedders can also hold
/// their own registry.
pub struct StoreRegistry {
    loaders: HashMap<&'static str, LoaderFn>,
}

impl StoreRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with all built-in store classes.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register(crate::zero_len::CLASS_NAME, crate::zero_len::load_boxed);
        r.register(crate::plain::CLASS_NAME, crate::plain::load_boxed);
        r.register(crate::zip_offset::CLASS_NAME, crate::zip_offset::load_boxed);
        r.register(crate::mixed_len::CLASS_NAME, crate::mixed_len::load_boxed);
        r.register(
            crate::entropy_zip::CLASS_NAME,
            crate::entropy_zip::load_boxed,
        );
        r.register(crate::dict_zip::CLASS_NAME, crate::dict_zip::load_boxed);
        r
    }

    /// Add or replace a loader.
    pub fn register(&mut self, class: &'static str, loader: LoaderFn) {
        self.loaders.insert(class, loader);
    }

    /// Load a store from owned or mapped memory, dispatching on the class
    /// name in the header.
    pub fn load(&self, mem: StoreMem) -> Result<Box<dyn BlobStore>> {
        let base = HeaderBase::parse(mem.as_slice())?;
        let loader = self.loaders.get(base.class_name.as_str()).ok_or_else(|| {
            Error::invalid_argument(format!("unknown store class {:?}", base.class_name))
        })?;
        loader(mem)
    }

    /// Map a file and load it.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<Box<dyn BlobStore>> {
        self.load(StoreMem::open(path)?)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// The process-wide registry with the built-in classes.
pub fn global_registry() -> &'static StoreRegistry {
    static REGISTRY: OnceLock<StoreRegistry> = OnceLock::new();
    REGISTRY.get_or_init(StoreRegistry::with_builtin)
}

/// Load any built-in store from a file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Box<dyn BlobStore>> {
    global_registry().load_from_file(path)
}

/// Load any built-in store from caller memory.
pub fn load_from_bytes(data: Vec<u8>) -> Result<Box<dyn BlobStore>> {
    global_registry().load(StoreMem::from_vec(data))
}
