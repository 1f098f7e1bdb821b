//! Sharded read-only LRU page cache over file descriptors.
//!
//! Each shard owns a pool of 4 KiB pages, a hash table keyed by
//! `(fi << 32) | page_index`, an LRU list threaded through a sentinel node,
//! per-file page lists, and a free list. All bookkeeping sits behind the
//! shard mutex; page *contents* are written only by the thread that
//! allocated the page (`is_loaded` false) while everyone else spins-yields
//! on the flag, so reads outside the lock are race-free.
//!
//! `pread` pins the covered page(s). A single-page read returns a pointer
//! straight into the pinned page; multi-page reads gather into the caller's
//! buffer and release immediately. When every page is pinned the cache
//! refuses with `ResourceExhausted`: size the cache to concurrency × peak
//! working set.

use oxizbs_core::error::{Error, Result};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cache page size.
pub const PAGE_SIZE: usize = 4096;

const NIL: u32 = 0;

/// `pread` on a raw fd, retrying on interrupts; bytes past EOF read as
/// zero.
pub fn fd_pread(fd: i32, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        // SAFETY: buf is a valid writable region of the given length.
        let n = unsafe {
            libc::pread(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            buf[done..].fill(0);
            return Ok(());
        }
        done += n as usize;
    }
    Ok(())
}

#[derive(Clone, Copy, Default)]
struct Node {
    key: u64,
    hash_next: u32,
    lru_prev: u32,
    lru_next: u32,
    file_prev: u32,
    file_next: u32,
    free_next: u32,
    refs: u32,
    used_before: bool,
    in_free: bool,
}

struct ShardInner {
    nodes: Vec<Node>,
    buckets: Vec<u32>,
    free_head: u32,
    file_heads: HashMap<u32, u32>,
}

impl ShardInner {
    fn bucket_of(&self, key: u64) -> usize {
        (mix(key) % self.buckets.len() as u64) as usize
    }

    fn bucket_insert(&mut self, i: u32) {
        let b = self.bucket_of(self.nodes[i as usize].key);
        self.nodes[i as usize].hash_next = self.buckets[b];
        self.buckets[b] = i;
    }

    fn bucket_unlink(&mut self, i: u32) {
        let b = self.bucket_of(self.nodes[i as usize].key);
        let mut cur = self.buckets[b];
        if cur == i {
            self.buckets[b] = self.nodes[i as usize].hash_next;
            return;
        }
        while cur != NIL {
            let next = self.nodes[cur as usize].hash_next;
            if next == i {
                self.nodes[cur as usize].hash_next = self.nodes[i as usize].hash_next;
                return;
            }
            cur = next;
        }
        debug_assert!(false, "node missing from its bucket");
    }

    fn lru_unlink(&mut self, i: u32) {
        let (p, n) = (
            self.nodes[i as usize].lru_prev,
            self.nodes[i as usize].lru_next,
        );
        self.nodes[p as usize].lru_next = n;
        self.nodes[n as usize].lru_prev = p;
        self.nodes[i as usize].lru_prev = i;
        self.nodes[i as usize].lru_next = i;
    }

    fn lru_push_head(&mut self, i: u32) {
        let head = self.nodes[0].lru_next;
        self.nodes[i as usize].lru_prev = 0;
        self.nodes[i as usize].lru_next = head;
        self.nodes[head as usize].lru_prev = i;
        self.nodes[0].lru_next = i;
    }

    fn file_insert(&mut self, fi: u32, i: u32) {
        let head = self.file_heads.get(&fi).copied().unwrap_or(NIL);
        self.nodes[i as usize].file_prev = NIL;
        self.nodes[i as usize].file_next = head;
        if head != NIL {
            self.nodes[head as usize].file_prev = i;
        }
        self.file_heads.insert(fi, i);
    }

    fn file_unlink(&mut self, i: u32) {
        let fi = (self.nodes[i as usize].key >> 32) as u32;
        let (p, n) = (
            self.nodes[i as usize].file_prev,
            self.nodes[i as usize].file_next,
        );
        if p != NIL {
            self.nodes[p as usize].file_next = n;
        } else {
            if n != NIL {
                self.file_heads.insert(fi, n);
            } else {
                self.file_heads.remove(&fi);
            }
        }
        if n != NIL {
            self.nodes[n as usize].file_prev = p;
        }
        self.nodes[i as usize].file_prev = NIL;
        self.nodes[i as usize].file_next = NIL;
    }

    fn free_push(&mut self, i: u32) {
        self.nodes[i as usize].free_next = self.free_head;
        self.nodes[i as usize].in_free = true;
        self.free_head = i;
    }
}

struct Shard {
    inner: Mutex<ShardInner>,
    pages: Box<[UnsafeCell<u8>]>,
    loaded: Box<[AtomicBool]>,
}

// SAFETY: page contents are single-writer (the allocating thread, gated by
// `loaded == false`) and read-only once `loaded` is set with Release; all
// index structures live behind the shard mutex.
unsafe impl Sync for Shard {}
unsafe impl Send for Shard {}

struct FileEntry {
    fd: i32,
    open: bool,
    dropped: bool,
}

/// Outcome counters, one per allocation/hit class.
#[derive(Default)]
pub struct CacheStats {
    /// Page found loaded in the cache.
    pub hit: AtomicU64,
    /// Page found while another thread was still loading it.
    pub hit_others_load: AtomicU64,
    /// Page taken from the never-used free pool.
    pub initial_free: AtomicU64,
    /// Page taken from a closed file's donation.
    pub dropped_free: AtomicU64,
    /// Page obtained by evicting the LRU tail.
    pub evicted_others: AtomicU64,
}

/// Sharded LRU page cache.
pub struct LruPageCache {
    shards: Vec<Shard>,
    files: Mutex<Vec<FileEntry>>,
    stats: CacheStats,
}

fn next_prime(mut n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }
    while !is_prime(n) {
        n += 1;
    }
    n
}

#[inline]
fn mix(key: u64) -> u64 {
    // 64-bit avalanche (xxhash-style finalizer).
    let mut h = key;
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51AFD7ED558CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CEB9FE1A85EC53);
    h ^ (h >> 33)
}

impl LruPageCache {
    /// Cache of roughly `capacity_bytes`, split into `shards` independent
    /// shards.
    pub fn new(capacity_bytes: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let pages_per_shard = (capacity_bytes / PAGE_SIZE / shards).max(1);
        let shards = (0..shards)
            .map(|_| {
                let n = pages_per_shard;
                let mut inner = ShardInner {
                    nodes: vec![Node::default(); n + 1],
                    buckets: vec![NIL; next_prime(n * 3 / 2 + 1)],
                    free_head: NIL,
                    file_heads: HashMap::new(),
                };
                for i in (1..=n as u32).rev() {
                    inner.free_push(i);
                }
                let mut pages = Vec::with_capacity(n * PAGE_SIZE);
                pages.resize_with(n * PAGE_SIZE, || UnsafeCell::new(0u8));
                let loaded = (0..n + 1).map(|_| AtomicBool::new(false)).collect();
                Shard {
                    inner: Mutex::new(inner),
                    pages: pages.into_boxed_slice(),
                    loaded,
                }
            })
            .collect();
        Self {
            shards,
            files: Mutex::new(Vec::new()),
            stats: CacheStats::default(),
        }
    }

    /// Outcome counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Register a file descriptor, returning its cache-wide file id.
    pub fn open(&self, fd: i32) -> Result<u32> {
        if fd < 0 {
            return Err(Error::invalid_argument(format!("bad fd {fd}")));
        }
        let mut files = self.files.lock().unwrap();
        files.push(FileEntry {
            fd,
            open: true,
            dropped: false,
        });
        Ok((files.len() - 1) as u32)
    }

    /// Drop a file id; its unpinned pages become reusable at once, pinned
    /// pages as they are released. Subsequent `pread` on the id fails.
    pub fn close(&self, fi: u32) -> Result<()> {
        {
            let mut files = self.files.lock().unwrap();
            let entry = files
                .get_mut(fi as usize)
                .ok_or_else(|| Error::invalid_argument(format!("bad file id {fi}")))?;
            entry.open = false;
            entry.dropped = true;
        }
        for shard in &self.shards {
            let mut inner = shard.inner.lock().unwrap();
            let mut cur = inner.file_heads.get(&fi).copied().unwrap_or(NIL);
            while cur != NIL {
                let next = inner.nodes[cur as usize].file_next;
                if inner.nodes[cur as usize].refs == 0 {
                    inner.lru_unlink(cur);
                    inner.bucket_unlink(cur);
                    inner.file_unlink(cur);
                    inner.free_push(cur);
                }
                cur = next;
            }
        }
        Ok(())
    }

    /// `close` under its defensive name: always safe, returns whether the
    /// id was still open.
    pub fn safe_close(&self, fi: u32) -> bool {
        let was_open = {
            let files = self.files.lock().unwrap();
            files.get(fi as usize).map(|f| f.open).unwrap_or(false)
        };
        let _ = self.close(fi);
        was_open
    }

    fn fd_of(&self, fi: u32) -> Result<i32> {
        let files = self.files.lock().unwrap();
        let entry = files
            .get(fi as usize)
            .ok_or_else(|| Error::invalid_argument(format!("bad file id {fi}")))?;
        if !entry.open {
            return Err(Error::invalid_argument(format!("file id {fi} is closed")));
        }
        Ok(entry.fd)
    }

    fn shard_of(&self, key: u64) -> usize {
        (mix(key.rotate_left(17)) % self.shards.len() as u64) as usize
    }

    /// Pin the page, loading it if necessary. Returns (shard, node).
    fn acquire_page(&self, fi: u32, page_no: u64) -> Result<(usize, u32)> {
        let key = ((fi as u64) << 32) | page_no;
        let si = self.shard_of(key);
        let shard = &self.shards[si];
        let fd = self.fd_of(fi)?;

        enum Got {
            Hit(u32),
            Load(u32),
        }
        let got = {
            let mut inner = shard.inner.lock().unwrap();
            let b = inner.bucket_of(key);
            let mut cur = inner.buckets[b];
            while cur != NIL && inner.nodes[cur as usize].key != key {
                cur = inner.nodes[cur as usize].hash_next;
            }
            if cur != NIL {
                inner.nodes[cur as usize].refs += 1;
                if inner.nodes[cur as usize].refs == 1 {
                    inner.lru_unlink(cur);
                }
                Got::Hit(cur)
            } else {
                let i = if inner.free_head != NIL {
                    let i = inner.free_head;
                    inner.free_head = inner.nodes[i as usize].free_next;
                    inner.nodes[i as usize].in_free = false;
                    if inner.nodes[i as usize].used_before {
                        self.stats.dropped_free.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.initial_free.fetch_add(1, Ordering::Relaxed);
                    }
                    i
                } else {
                    let tail = inner.nodes[0].lru_prev;
                    if tail == NIL {
                        return Err(Error::exhausted(
                            "every cache page is pinned; grow the cache",
                        ));
                    }
                    inner.lru_unlink(tail);
                    inner.bucket_unlink(tail);
                    inner.file_unlink(tail);
                    self.stats.evicted_others.fetch_add(1, Ordering::Relaxed);
                    tail
                };
                inner.nodes[i as usize].key = key;
                inner.nodes[i as usize].refs = 1;
                inner.nodes[i as usize].used_before = true;
                shard.loaded[i as usize].store(false, Ordering::Relaxed);
                inner.bucket_insert(i);
                inner.file_insert(fi, i);
                Got::Load(i)
            }
        };

        match got {
            Got::Load(node) => {
                // SAFETY: this thread owns the page until `loaded` flips;
                // no reader touches the bytes before that.
                let slice = unsafe {
                    std::slice::from_raw_parts_mut(
                        shard.pages.as_ptr().add((node as usize - 1) * PAGE_SIZE) as *mut u8,
                        PAGE_SIZE,
                    )
                };
                if let Err(e) = fd_pread(fd, page_no * PAGE_SIZE as u64, slice) {
                    // Unblock any waiter, then release our pin and fail.
                    slice.fill(0);
                    shard.loaded[node as usize].store(true, Ordering::Release);
                    self.release_page(si, node);
                    return Err(e);
                }
                shard.loaded[node as usize].store(true, Ordering::Release);
                Ok((si, node))
            }
            Got::Hit(node) => {
                if !shard.loaded[node as usize].load(Ordering::Acquire) {
                    self.stats.hit_others_load.fetch_add(1, Ordering::Relaxed);
                    while !shard.loaded[node as usize].load(Ordering::Acquire) {
                        std::thread::yield_now();
                    }
                } else {
                    self.stats.hit.fetch_add(1, Ordering::Relaxed);
                }
                Ok((si, node))
            }
        }
    }

    fn page_slice(&self, shard: usize, node: u32) -> &[u8] {
        // SAFETY: the page is pinned and loaded; contents are immutable
        // until released.
        unsafe {
            std::slice::from_raw_parts(
                self.shards[shard].pages.as_ptr().add((node as usize - 1) * PAGE_SIZE)
                    as *const u8,
                PAGE_SIZE,
            )
        }
    }

    fn release_page(&self, shard: usize, node: u32) {
        let key_fi = {
            let inner = self.shards[shard].inner.lock().unwrap();
            (inner.nodes[node as usize].key >> 32) as u32
        };
        let dropped = {
            let files = self.files.lock().unwrap();
            files
                .get(key_fi as usize)
                .map(|f| f.dropped)
                .unwrap_or(false)
        };
        let mut inner = self.shards[shard].inner.lock().unwrap();
        debug_assert!(inner.nodes[node as usize].refs > 0);
        inner.nodes[node as usize].refs -= 1;
        if inner.nodes[node as usize].refs == 0 {
            if dropped {
                inner.bucket_unlink(node);
                inner.file_unlink(node);
                inner.free_push(node);
            } else {
                inner.lru_push_head(node);
            }
        }
    }

    /// Read `len` bytes at `offset`. When the range sits inside one page
    /// the result points into the pinned page; otherwise the fragments are
    /// gathered into `buf`.
    pub fn pread<'a>(
        &'a self,
        fi: u32,
        offset: u64,
        len: usize,
        buf: &'a mut Vec<u8>,
    ) -> Result<PageRead<'a>> {
        let page_no = offset / PAGE_SIZE as u64;
        let in_page = (offset % PAGE_SIZE as u64) as usize;
        if in_page + len <= PAGE_SIZE {
            let (shard, node) = self.acquire_page(fi, page_no)?;
            let data = &self.page_slice(shard, node)[in_page..in_page + len];
            return Ok(PageRead {
                cache: self,
                pin: Some((shard, node)),
                ptr: data.as_ptr(),
                len,
            });
        }
        buf.clear();
        buf.reserve(len);
        let mut at = offset;
        let end = offset + len as u64;
        while at < end {
            let page_no = at / PAGE_SIZE as u64;
            let in_page = (at % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - in_page).min((end - at) as usize);
            let (shard, node) = self.acquire_page(fi, page_no)?;
            buf.extend_from_slice(&self.page_slice(shard, node)[in_page..in_page + take]);
            self.release_page(shard, node);
            at += take as u64;
        }
        Ok(PageRead {
            cache: self,
            pin: None,
            ptr: buf.as_ptr(),
            len,
        })
    }
}

/// Result of [`LruPageCache::pread`]; releases its page pin on drop.
pub struct PageRead<'a> {
    cache: &'a LruPageCache,
    pin: Option<(usize, u32)>,
    ptr: *const u8,
    len: usize,
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len point either into a page pinned for our
        // lifetime or into the caller's buffer borrowed for 'a.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        if let Some((shard, node)) = self.pin.take() {
            self.cache.release_page(shard, node);
        }
    }
}

// SAFETY: PageRead only exposes shared immutable bytes.
unsafe impl Send for PageRead<'_> {}
unsafe impl Sync for PageRead<'_> {}

/// A page-cache file as a [`crate::store::RecordSource`].
pub struct CachedSource<'a> {
    cache: &'a LruPageCache,
    fi: u32,
    base: u64,
    buf: Vec<u8>,
}

impl<'a> CachedSource<'a> {
    /// Source reading file `fi` through `cache`; offsets are shifted by
    /// `base` (the store file's position within the fd).
    pub fn new(cache: &'a LruPageCache, fi: u32, base: u64) -> Self {
        Self {
            cache,
            fi,
            base,
            buf: Vec::new(),
        }
    }
}

impl crate::store::RecordSource for CachedSource<'_> {
    fn read_at<'s>(
        &'s mut self,
        offset: u64,
        len: usize,
        scratch: &'s mut Vec<u8>,
    ) -> Result<&'s [u8]> {
        let r = self.cache.pread(self.fi, self.base + offset, len, &mut self.buf)?;
        // The page pin cannot outlive this call, so hand back a copy in
        // the caller's scratch.
        scratch.clear();
        scratch.extend_from_slice(&r);
        drop(r);
        Ok(&scratch[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 131) ^ (i >> 7)) as u8).collect()
    }

    #[test]
    fn test_pread_matches_file() {
        let content = pattern(10 * PAGE_SIZE + 123);
        let f = temp_file(&content);
        let cache = LruPageCache::new(64 * PAGE_SIZE, 2);
        let fi = cache.open(f.as_file().as_raw_fd()).unwrap();
        let mut buf = Vec::new();
        for (off, len) in [
            (0usize, 100usize),
            (PAGE_SIZE - 10, 20),
            (3 * PAGE_SIZE + 5, 2 * PAGE_SIZE),
            (0, 5 * PAGE_SIZE),
            (9 * PAGE_SIZE, PAGE_SIZE),
            (10 * PAGE_SIZE, 123),
        ] {
            let r = cache.pread(fi, off as u64, len, &mut buf).unwrap();
            assert_eq!(&*r, &content[off..off + len], "off {off} len {len}");
        }
        cache.close(fi).unwrap();
        assert!(cache.pread(fi, 0, 10, &mut buf).is_err());
    }

    #[test]
    fn test_wraparound_eviction_counters() {
        // 4-page cache, one shard; 100 sequential page reads must be
        // 4 initial allocations plus 96 evictions.
        let content = pattern(100 * PAGE_SIZE);
        let f = temp_file(&content);
        let cache = LruPageCache::new(4 * PAGE_SIZE, 1);
        let fi = cache.open(f.as_file().as_raw_fd()).unwrap();
        let mut buf = Vec::new();
        for p in 0..100usize {
            let r = cache
                .pread(fi, (p * PAGE_SIZE) as u64, PAGE_SIZE, &mut buf)
                .unwrap();
            assert_eq!(&*r, &content[p * PAGE_SIZE..(p + 1) * PAGE_SIZE], "page {p}");
        }
        let s = cache.stats();
        assert_eq!(
            s.initial_free.load(Ordering::Relaxed) + s.evicted_others.load(Ordering::Relaxed),
            100
        );
    }

    #[test]
    fn test_hits_do_not_evict() {
        let content = pattern(8 * PAGE_SIZE);
        let f = temp_file(&content);
        let cache = LruPageCache::new(8 * PAGE_SIZE, 1);
        let fi = cache.open(f.as_file().as_raw_fd()).unwrap();
        let mut buf = Vec::new();
        for _ in 0..5 {
            for p in 0..4usize {
                let r = cache.pread(fi, (p * PAGE_SIZE) as u64, 64, &mut buf).unwrap();
                assert_eq!(&*r, &content[p * PAGE_SIZE..p * PAGE_SIZE + 64]);
            }
        }
        let s = cache.stats();
        assert_eq!(s.evicted_others.load(Ordering::Relaxed), 0);
        assert_eq!(s.initial_free.load(Ordering::Relaxed), 4);
        assert_eq!(s.hit.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_all_pinned_exhausts() {
        let content = pattern(8 * PAGE_SIZE);
        let f = temp_file(&content);
        let cache = LruPageCache::new(2 * PAGE_SIZE, 1);
        let fi = cache.open(f.as_file().as_raw_fd()).unwrap();
        let mut b1 = Vec::new();
        let mut b2 = Vec::new();
        let mut b3 = Vec::new();
        let r1 = cache.pread(fi, 0, 16, &mut b1).unwrap();
        let r2 = cache.pread(fi, PAGE_SIZE as u64, 16, &mut b2).unwrap();
        assert!(cache.pread(fi, 2 * PAGE_SIZE as u64, 16, &mut b3).is_err());
        drop(r1);
        let r3 = cache.pread(fi, 2 * PAGE_SIZE as u64, 16, &mut b3).unwrap();
        assert_eq!(&*r3, &content[2 * PAGE_SIZE..2 * PAGE_SIZE + 16]);
        drop(r2);
    }

    #[test]
    fn test_closed_file_donates_pages() {
        let content = pattern(8 * PAGE_SIZE);
        let f1 = temp_file(&content);
        let f2 = temp_file(&content);
        let cache = LruPageCache::new(4 * PAGE_SIZE, 1);
        let fi1 = cache.open(f1.as_file().as_raw_fd()).unwrap();
        let fi2 = cache.open(f2.as_file().as_raw_fd()).unwrap();
        let mut buf = Vec::new();
        for p in 0..4usize {
            cache.pread(fi1, (p * PAGE_SIZE) as u64, 8, &mut buf).unwrap();
        }
        cache.close(fi1).unwrap();
        for p in 0..4usize {
            cache.pread(fi2, (p * PAGE_SIZE) as u64, 8, &mut buf).unwrap();
        }
        let s = cache.stats();
        assert_eq!(s.dropped_free.load(Ordering::Relaxed), 4);
        assert_eq!(s.evicted_others.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_readers_agree() {
        let content = pattern(32 * PAGE_SIZE);
        let f = temp_file(&content);
        let cache = std::sync::Arc::new(LruPageCache::new(8 * PAGE_SIZE, 4));
        let fi = cache.open(f.as_file().as_raw_fd()).unwrap();
        let mut handles = Vec::new();
        for t in 0..4usize {
            let cache = std::sync::Arc::clone(&cache);
            let content = content.clone();
            handles.push(std::thread::spawn(move || {
                let mut buf = Vec::new();
                for i in 0..400usize {
                    let off = ((i * 37 + t * 11) % (29 * PAGE_SIZE)) as u64;
                    let len = 1 + (i % (2 * PAGE_SIZE));
                    let r = cache.pread(fi, off, len, &mut buf).unwrap();
                    assert_eq!(&*r, &content[off as usize..off as usize + len]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
