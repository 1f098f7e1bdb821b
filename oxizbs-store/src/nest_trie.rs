//! Interface to an external trie index.
//!
//! A trie-backed store keeps record bytes *as* trie keys: record id maps to
//! a key id and the trie reconstructs the bytes. The trie itself lives
//! outside this crate; stores only consume this contract.

use crate::store::BlobStore;
use oxizbs_core::error::{Error, Result};

/// Contract a trie must satisfy to back a blob store.
pub trait TrieIndex: Send + Sync {
    /// Number of keys.
    fn num_keys(&self) -> usize;

    /// Append the key with the given id to `out`.
    fn key_append(&self, key_id: usize, out: &mut Vec<u8>) -> Result<()>;

    /// Resident bytes.
    fn mem_size(&self) -> usize;
}

/// Blob store over an external trie: record id i is key id i.
pub struct TrieBlobStore<T: TrieIndex> {
    trie: T,
    total_size: u64,
}

impl<T: TrieIndex> TrieBlobStore<T> {
    /// Wrap a finished trie. `total_size` is the sum of key lengths.
    pub fn new(trie: T, total_size: u64) -> Self {
        Self { trie, total_size }
    }

    /// Borrow the underlying trie.
    pub fn trie(&self) -> &T {
        &self.trie
    }
}

impl<T: TrieIndex> BlobStore for TrieBlobStore<T> {
    fn name(&self) -> &'static str {
        "NestLoudsTrieBlobStore"
    }

    fn num_records(&self) -> usize {
        self.trie.num_keys()
    }

    fn total_data_size(&self) -> u64 {
        self.total_size
    }

    fn mem_size(&self) -> usize {
        self.trie.mem_size()
    }

    fn get_record_append(&self, id: usize, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.trie.num_keys() {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        self.trie.key_append(id, out)
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        Vec::new()
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        Vec::new()
    }
}
