//! Store for corpora where every record is empty.
//!
//! Only the record count is meaningful; the file is a bare header and
//! footer.

use crate::format::{FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, validate_file};
use crate::store::{BlobStore, RecordSource};
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::xxh::seed;

/// Class name in file headers.
pub const CLASS_NAME: &str = "ZeroLengthBlobStore";

/// Builder: counts empty records.
#[derive(Default)]
pub struct ZeroLenBuilder {
    records: u64,
}

impl ZeroLenBuilder {
    /// New builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record, which must be empty.
    pub fn add_record(&mut self, rec: &[u8]) -> Result<()> {
        if !rec.is_empty() {
            return Err(Error::invalid_argument(format!(
                "zero-length store got a {}-byte record",
                rec.len()
            )));
        }
        self.records += 1;
        Ok(())
    }

    /// Serialize the store file.
    pub fn finish(self) -> Vec<u8> {
        build_file(self.records)
    }
}

fn build_file(records: u64) -> Vec<u8> {
    let mut base = HeaderBase::new(CLASS_NAME, 1);
    base.records = records;
    base.file_size = (HEADER_SIZE + FOOTER_SIZE) as u64;
    let mut header = [0u8; HEADER_SIZE];
    header[..80].copy_from_slice(&base.to_bytes());
    let mut a = FileAssembler::new(seed::BLOB_STORE);
    a.write(&header);
    a.finish()
}

/// Loaded zero-length store.
pub struct ZeroLenStore {
    _mem: StoreMem,
    records: u64,
}

impl ZeroLenStore {
    /// Load and validate.
    pub fn load(mem: StoreMem) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::BLOB_STORE)?;
        Ok(Self {
            _mem: mem,
            records: base.records,
        })
    }
}

/// Registry loader.
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(ZeroLenStore::load(mem)?))
}

impl BlobStore for ZeroLenStore {
    fn name(&self) -> &'static str {
        CLASS_NAME
    }

    fn num_records(&self) -> usize {
        self.records as usize
    }

    fn total_data_size(&self) -> u64 {
        0
    }

    fn mem_size(&self) -> usize {
        0
    }

    fn get_record_append(&self, id: usize, _out: &mut Vec<u8>) -> Result<()> {
        if id >= self.records as usize {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        Ok(())
    }

    fn fspread_record_append(
        &self,
        _src: &mut dyn RecordSource,
        _base_offset: u64,
        id: usize,
        _out: &mut Vec<u8>,
        _rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        if id >= self.records as usize {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        Ok(())
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        Vec::new()
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        Vec::new()
    }

    fn reorder_zip_data(
        &self,
        new_to_old: &mut dyn Iterator<Item = usize>,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut n = 0u64;
        for old in new_to_old {
            if old >= self.records as usize {
                return Err(Error::invalid_argument(format!("record id {old} out of range")));
            }
            n += 1;
        }
        write(&build_file(n));
        Ok(())
    }

    fn purge_zip_data(
        &self,
        is_del: &dyn Fn(usize) -> bool,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let survivors = (0..self.records as usize).filter(|&i| !is_del(i)).count();
        write(&build_file(survivors as u64));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut b = ZeroLenBuilder::new();
        for _ in 0..5 {
            b.add_record(b"").unwrap();
        }
        let file = b.finish();
        let store = ZeroLenStore::load(StoreMem::from_vec(file)).unwrap();
        assert_eq!(store.num_records(), 5);
        assert_eq!(store.get_record(4).unwrap(), b"");
        assert!(store.get_record(5).is_err());
    }

    #[test]
    fn test_rejects_payload() {
        let mut b = ZeroLenBuilder::new();
        assert!(b.add_record(b"x").is_err());
    }

    #[test]
    fn test_empty_store_footer_valid() {
        let file = ZeroLenBuilder::new().finish();
        let store = ZeroLenStore::load(StoreMem::from_vec(file)).unwrap();
        assert_eq!(store.num_records(), 0);
    }
}
