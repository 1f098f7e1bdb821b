//! Plain store: raw record concatenation plus a bit-packed offset index.
//!
//! Header extension (bytes 80..128):
//!
//! ```text
//! [content_bytes u64][offsets_bytes u64][offsets_uint_bits u8][pad; 23]
//! ```
//!
//! Payload layout: content (16-aligned) then the offset index (16-aligned).

use crate::format::{FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, align16, validate_file};
use crate::store::{BlobStore, RecordSource};
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::uint_vec::{UintVecBuilder, UintVecView, compute_mem_size, uint_bits};
use oxizbs_core::xxh::seed;

/// Class name in file headers.
pub const CLASS_NAME: &str = "PlainBlobStore";

/// Builder: appends records and packs the offsets at the end.
#[derive(Default)]
pub struct PlainBuilder {
    content: Vec<u8>,
    offsets: Vec<u64>,
}

impl PlainBuilder {
    /// New builder.
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
            offsets: vec![0],
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, rec: &[u8]) {
        self.content.extend_from_slice(rec);
        self.offsets.push(self.content.len() as u64);
    }

    /// Serialize the store file.
    pub fn finish(self) -> Vec<u8> {
        build_file(&self.content, &self.offsets)
    }
}

fn build_file(content: &[u8], offsets: &[u64]) -> Vec<u8> {
    let bits = uint_bits(content.len() as u64);
    let mut ob = UintVecBuilder::with_width(bits);
    for &o in offsets {
        ob.push(o);
    }
    let offset_bytes = ob.into_bytes();

    let mut base = HeaderBase::new(CLASS_NAME, 1);
    base.records = offsets.len() as u64 - 1;
    base.unzip_size = content.len() as u64;
    base.file_size =
        (HEADER_SIZE + align16(content.len()) + align16(offset_bytes.len()) + FOOTER_SIZE) as u64;

    let mut header = [0u8; HEADER_SIZE];
    header[..80].copy_from_slice(&base.to_bytes());
    header[80..88].copy_from_slice(&(content.len() as u64).to_le_bytes());
    header[88..96].copy_from_slice(&(offset_bytes.len() as u64).to_le_bytes());
    header[96] = bits as u8;

    let mut a = FileAssembler::new(seed::PLAIN);
    a.write(&header);
    a.write(content);
    a.pad16();
    a.write(&offset_bytes);
    a.pad16();
    a.finish()
}

/// Loaded plain store.
pub struct PlainStore {
    mem: StoreMem,
    records: usize,
    unzip_size: u64,
    content_bytes: usize,
    offsets_off: usize,
    offsets_len: usize,
    offsets_bits: usize,
    detached_offsets: Option<Vec<u8>>,
}

impl PlainStore {
    /// Load and validate.
    pub fn load(mem: StoreMem) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::PLAIN)?;
        let data = mem.as_slice();
        let ext = &data[80..HEADER_SIZE];
        let content_bytes = u64::from_le_bytes(ext[0..8].try_into().unwrap()) as usize;
        let offsets_bytes = u64::from_le_bytes(ext[8..16].try_into().unwrap()) as usize;
        let bits = ext[16] as usize;
        let offsets_off = HEADER_SIZE + align16(content_bytes);
        if offsets_off + offsets_bytes + FOOTER_SIZE > data.len() {
            return Err(Error::corrupted(80, "sections exceed file size"));
        }
        let records = base.records as usize;
        if compute_mem_size(bits, records + 1) > offsets_bytes {
            return Err(Error::corrupted(88, "offset index shorter than declared"));
        }
        Ok(Self {
            mem,
            records,
            unzip_size: base.unzip_size,
            content_bytes,
            offsets_off,
            offsets_len: offsets_bytes,
            offsets_bits: bits,
            detached_offsets: None,
        })
    }

    fn content(&self) -> &[u8] {
        &self.mem.as_slice()[HEADER_SIZE..HEADER_SIZE + self.content_bytes]
    }

    fn offsets(&self) -> UintVecView<'_> {
        let bytes = match &self.detached_offsets {
            Some(v) => &v[..],
            None => &self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len],
        };
        UintVecView::new(bytes, self.offsets_bits, self.records + 1)
    }

    fn span(&self, id: usize) -> Result<(usize, usize)> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets().get2(id);
        if b < a || b as usize > self.content_bytes {
            return Err(Error::corrupted(self.offsets_off as u64, "offset index out of order"));
        }
        Ok((a as usize, b as usize))
    }
}

/// Registry loader.
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(PlainStore::load(mem)?))
}

impl BlobStore for PlainStore {
    fn name(&self) -> &'static str {
        CLASS_NAME
    }

    fn num_records(&self) -> usize {
        self.records
    }

    fn total_data_size(&self) -> u64 {
        self.unzip_size
    }

    fn mem_size(&self) -> usize {
        self.content_bytes + self.offsets_len
    }

    fn get_record_append(&self, id: usize, out: &mut Vec<u8>) -> Result<()> {
        let (a, b) = self.span(id)?;
        out.extend_from_slice(&self.content()[a..b]);
        Ok(())
    }

    fn fspread_record_append(
        &self,
        src: &mut dyn RecordSource,
        base_offset: u64,
        id: usize,
        out: &mut Vec<u8>,
        rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        let (a, b) = self.span(id)?;
        let bytes = src.read_at(base_offset + (HEADER_SIZE + a) as u64, b - a, rdbuf)?;
        out.extend_from_slice(bytes);
        Ok(())
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        let bytes = match &self.detached_offsets {
            Some(v) => &v[..],
            None => &self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len],
        };
        vec![bytes]
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        vec![self.content()]
    }

    fn detach_meta_blocks(&mut self, blocks: Vec<Vec<u8>>) -> Result<()> {
        let [offsets] = <[Vec<u8>; 1]>::try_from(blocks)
            .map_err(|_| Error::invalid_argument("expected exactly one meta block"))?;
        if offsets.len() != self.offsets_len {
            return Err(Error::invalid_argument(format!(
                "meta block is {} bytes, expected {}",
                offsets.len(),
                self.offsets_len
            )));
        }
        self.detached_offsets = Some(offsets);
        Ok(())
    }

    fn reorder_zip_data(
        &self,
        new_to_old: &mut dyn Iterator<Item = usize>,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut content = Vec::with_capacity(self.content_bytes);
        let mut offsets = vec![0u64];
        for old in new_to_old {
            let (a, b) = self.span(old)?;
            content.extend_from_slice(&self.content()[a..b]);
            offsets.push(content.len() as u64);
        }
        write(&build_file(&content, &offsets));
        Ok(())
    }

    fn purge_zip_data(
        &self,
        is_del: &dyn Fn(usize) -> bool,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut survivors = (0..self.records).filter(|&i| !is_del(i));
        self.reorder_zip_data(&mut survivors, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<Vec<u8>> {
        vec![
            b"alpha".to_vec(),
            b"".to_vec(),
            b"beta-beta".to_vec(),
            vec![0xAB; 1000],
            b"tail".to_vec(),
        ]
    }

    fn build(records: &[Vec<u8>]) -> PlainStore {
        let mut b = PlainBuilder::new();
        for r in records {
            b.add_record(r);
        }
        PlainStore::load(StoreMem::from_vec(b.finish())).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let records = sample_records();
        let store = build(&records);
        assert_eq!(store.num_records(), records.len());
        let total: u64 = records.iter().map(|r| r.len() as u64).sum();
        assert_eq!(store.total_data_size(), total);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r);
        }
    }

    #[test]
    fn test_reorder_and_purge() {
        let records = sample_records();
        let store = build(&records);
        let perm = [4usize, 0, 3, 1, 2];
        let mut out = Vec::new();
        store
            .reorder_zip_data(&mut perm.iter().copied(), &mut |b| out.extend_from_slice(b))
            .unwrap();
        let reordered = PlainStore::load(StoreMem::from_vec(out)).unwrap();
        for (new_id, &old_id) in perm.iter().enumerate() {
            assert_eq!(
                reordered.get_record(new_id).unwrap(),
                records[old_id],
                "π({new_id})"
            );
        }

        let deleted = [1usize, 3];
        let mut out = Vec::new();
        store
            .purge_zip_data(&|i| deleted.contains(&i), &mut |b| out.extend_from_slice(b))
            .unwrap();
        let purged = PlainStore::load(StoreMem::from_vec(out)).unwrap();
        let survivors: Vec<usize> = (0..records.len()).filter(|i| !deleted.contains(i)).collect();
        assert_eq!(purged.num_records(), survivors.len());
        for (new_id, &old_id) in survivors.iter().enumerate() {
            assert_eq!(purged.get_record(new_id).unwrap(), records[old_id]);
        }
    }

    #[test]
    fn test_detach_meta() {
        let records = sample_records();
        let mut store = build(&records);
        let blocks: Vec<Vec<u8>> = store.get_meta_blocks().iter().map(|b| b.to_vec()).collect();
        store.detach_meta_blocks(blocks).unwrap();
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r);
        }
    }
}
