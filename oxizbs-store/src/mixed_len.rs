//! Mixed-length store: fixed-stride packing for the dominant record length.
//!
//! Records whose length equals the corpus mode are packed back to back with
//! no index at all; the rest keep their own offset index. A rank-select
//! bitmap over record ids maps each id to its rank inside the fixed or
//! variable section in constant time.
//!
//! Header extension (bytes 80..128):
//!
//! ```text
//! [unzip_size u64][offsets_uint_bits u8][checksum_level u8][pad; 6]
//! [fixed_len u32][bitmap_bytes_div8 u32][var_len_bytes u64][fixed_num u64]
//! [pad u64]
//! ```
//!
//! Payload: fixed section, variable section, variable offsets, id bitmap.
//! At checksum level >= 2 each variable record carries a CRC-16 trailer.

use crate::format::{FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, align16, validate_file};
use crate::store::{BlobStore, RecordSource};
use oxizbs_core::crc::Crc16;
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::rank_select::{BitVec, RankSelect};
use oxizbs_core::uint_vec::{UintVecBuilder, UintVecView, uint_bits};
use oxizbs_core::xxh::{checksum_verify_enabled, seed};
use std::collections::HashMap;

/// Class name in file headers.
pub const CLASS_NAME: &str = "MixedLenBlobStore";

/// Build-time options.
#[derive(Clone, Copy)]
pub struct MixedLenOptions {
    /// >= 2 adds a CRC-16 trailer to variable-length records.
    pub checksum_level: u8,
}

impl Default for MixedLenOptions {
    fn default() -> Self {
        Self { checksum_level: 1 }
    }
}

/// Builder: buffers records, picks the mode length at finish.
pub struct MixedLenBuilder {
    opts: MixedLenOptions,
    records: Vec<Vec<u8>>,
}

impl MixedLenBuilder {
    /// New builder.
    pub fn new(opts: MixedLenOptions) -> Self {
        Self {
            opts,
            records: Vec::new(),
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, rec: &[u8]) {
        self.records.push(rec.to_vec());
    }

    /// Serialize the store file.
    pub fn finish(self) -> Vec<u8> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for r in &self.records {
            *counts.entry(r.len()).or_insert(0) += 1;
        }
        // The mode; ties break toward the shorter length for a smaller
        // fixed section.
        let fixed_len = counts
            .iter()
            .max_by_key(|&(len, n)| (*n, std::cmp::Reverse(*len)))
            .map(|(&len, _)| len)
            .unwrap_or(0);

        let trailer = if self.opts.checksum_level >= 2 { 2 } else { 0 };
        let mut fixed = Vec::new();
        let mut var = Vec::new();
        let mut var_offsets = vec![0u64];
        let mut is_fixed = BitVec::new();
        let mut fixed_num = 0u64;
        let mut unzip = 0u64;
        for r in &self.records {
            unzip += r.len() as u64;
            if r.len() == fixed_len {
                fixed.extend_from_slice(r);
                is_fixed.push(true);
                fixed_num += 1;
            } else {
                var.extend_from_slice(r);
                if trailer > 0 {
                    var.extend_from_slice(&Crc16::compute(r).to_le_bytes());
                }
                var_offsets.push(var.len() as u64);
                is_fixed.push(false);
            }
        }

        let bits = uint_bits(var.len() as u64);
        let mut ob = UintVecBuilder::with_width(bits);
        for &o in &var_offsets {
            ob.push(o);
        }
        let offset_bytes = ob.into_bytes();
        let bitmap = {
            let mut b = is_fixed.to_bytes();
            b.resize(b.len().next_multiple_of(8), 0);
            b
        };

        let mut base = HeaderBase::new(CLASS_NAME, 1);
        base.records = self.records.len() as u64;
        base.unzip_size = unzip;
        base.file_size = (HEADER_SIZE
            + align16(fixed.len())
            + align16(var.len())
            + align16(offset_bytes.len())
            + align16(bitmap.len())
            + FOOTER_SIZE) as u64;

        let mut header = [0u8; HEADER_SIZE];
        header[..80].copy_from_slice(&base.to_bytes());
        header[80..88].copy_from_slice(&unzip.to_le_bytes());
        header[88] = bits as u8;
        header[89] = self.opts.checksum_level;
        header[96..100].copy_from_slice(&(fixed_len as u32).to_le_bytes());
        header[100..104].copy_from_slice(&((bitmap.len() / 8) as u32).to_le_bytes());
        header[104..112].copy_from_slice(&(var.len() as u64).to_le_bytes());
        header[112..120].copy_from_slice(&fixed_num.to_le_bytes());

        let mut a = FileAssembler::new(seed::MIXED_LEN);
        a.write(&header);
        a.write(&fixed);
        a.pad16();
        a.write(&var);
        a.pad16();
        a.write(&offset_bytes);
        a.pad16();
        a.write(&bitmap);
        a.pad16();
        a.finish()
    }
}

/// Loaded mixed-length store.
pub struct MixedLenStore {
    mem: StoreMem,
    records: usize,
    unzip_size: u64,
    fixed_len: usize,
    fixed_num: usize,
    fixed_off: usize,
    var_off: usize,
    var_bytes: usize,
    offsets_off: usize,
    offsets_bits: usize,
    checksum_level: u8,
    is_fixed: RankSelect,
}

impl MixedLenStore {
    /// Load and validate; the rank directory is rebuilt from the bitmap.
    pub fn load(mem: StoreMem) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::MIXED_LEN)?;
        let data = mem.as_slice();
        let ext = &data[80..HEADER_SIZE];
        let offsets_bits = ext[8] as usize;
        let checksum_level = ext[9];
        let fixed_len = u32::from_le_bytes(ext[16..20].try_into().unwrap()) as usize;
        let bitmap_div8 = u32::from_le_bytes(ext[20..24].try_into().unwrap()) as usize;
        let var_bytes = u64::from_le_bytes(ext[24..32].try_into().unwrap()) as usize;
        let fixed_num = u64::from_le_bytes(ext[32..40].try_into().unwrap()) as usize;
        let records = base.records as usize;

        if fixed_num > records {
            return Err(Error::corrupted(112, "more fixed records than records"));
        }
        let fixed_span = fixed_num
            .checked_mul(fixed_len)
            .ok_or_else(|| Error::corrupted(96, "fixed section size overflow"))?;
        let fixed_off = HEADER_SIZE;
        let var_off = fixed_off + align16(fixed_span);
        let offsets_off = var_off + align16(var_bytes);
        let var_num = records - fixed_num;
        let offsets_len =
            oxizbs_core::uint_vec::compute_mem_size(offsets_bits, var_num + 1);
        let bitmap_off = offsets_off + align16(offsets_len);
        if bitmap_off + bitmap_div8 * 8 + FOOTER_SIZE > data.len() {
            return Err(Error::corrupted(80, "sections exceed file size"));
        }
        let is_fixed = RankSelect::new(BitVec::from_bytes(
            &data[bitmap_off..bitmap_off + bitmap_div8 * 8],
            records,
        ));
        if is_fixed.ones() != fixed_num {
            return Err(Error::corrupted(
                bitmap_off as u64,
                "bitmap does not match fixed record count",
            ));
        }
        Ok(Self {
            mem,
            records,
            unzip_size: base.unzip_size,
            fixed_len,
            fixed_num,
            fixed_off,
            var_off,
            var_bytes,
            offsets_off,
            offsets_bits,
            checksum_level,
            is_fixed,
        })
    }

    fn var_offsets(&self) -> UintVecView<'_> {
        let var_num = self.records - self.fixed_num;
        let len = oxizbs_core::uint_vec::compute_mem_size(self.offsets_bits, var_num + 1);
        UintVecView::new(
            &self.mem.as_slice()[self.offsets_off..self.offsets_off + len],
            self.offsets_bits,
            var_num + 1,
        )
    }

    /// (absolute file offset, stored length, is_fixed) of a record's body.
    fn locate(&self, id: usize) -> Result<(usize, usize, bool)> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        if self.is_fixed.get(id) {
            let rank = self.is_fixed.rank1(id);
            Ok((self.fixed_off + rank * self.fixed_len, self.fixed_len, true))
        } else {
            let rank = self.is_fixed.rank0(id);
            let (a, b) = self.var_offsets().get2(rank);
            if b < a || b as usize > self.var_bytes {
                return Err(Error::corrupted(
                    self.offsets_off as u64,
                    "variable offset index out of order",
                ));
            }
            Ok((self.var_off + a as usize, (b - a) as usize, false))
        }
    }

    fn append_body(&self, body: &[u8], fixed: bool, out: &mut Vec<u8>) -> Result<()> {
        if fixed || self.checksum_level < 2 {
            out.extend_from_slice(body);
            return Ok(());
        }
        if body.len() < 2 {
            return Err(Error::corrupted(0, "variable record shorter than its trailer"));
        }
        let (rec, tail) = body.split_at(body.len() - 2);
        if checksum_verify_enabled() {
            let expect = u16::from_le_bytes(tail.try_into().unwrap());
            let got = Crc16::compute(rec);
            if got != expect {
                return Err(Error::bad_checksum("crc16", expect as u64, got as u64));
            }
        }
        out.extend_from_slice(rec);
        Ok(())
    }

    /// The fixed record length (the corpus mode).
    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    /// Number of fixed-length records.
    pub fn fixed_num(&self) -> usize {
        self.fixed_num
    }
}

/// Registry loader.
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(MixedLenStore::load(mem)?))
}

impl BlobStore for MixedLenStore {
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
        self.mem.len()
    }

    fn get_record_append(&self, id: usize, out: &mut Vec<u8>) -> Result<()> {
        let (at, len, fixed) = self.locate(id)?;
        self.append_body(&self.mem.as_slice()[at..at + len], fixed, out)
    }

    fn fspread_record_append(
        &self,
        src: &mut dyn RecordSource,
        base_offset: u64,
        id: usize,
        out: &mut Vec<u8>,
        rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        let (at, len, fixed) = self.locate(id)?;
        let bytes = src.read_at(base_offset + at as u64, len, rdbuf)?;
        let body = bytes.to_vec();
        self.append_body(&body, fixed, out)
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        let data = self.mem.as_slice();
        let var_num = self.records - self.fixed_num;
        let offsets_len = oxizbs_core::uint_vec::compute_mem_size(self.offsets_bits, var_num + 1);
        vec![&data[self.offsets_off..self.offsets_off + offsets_len]]
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        let data = self.mem.as_slice();
        vec![
            &data[self.fixed_off..self.fixed_off + self.fixed_num * self.fixed_len],
            &data[self.var_off..self.var_off + self.var_bytes],
        ]
    }

    fn reorder_zip_data(
        &self,
        new_to_old: &mut dyn Iterator<Item = usize>,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut b = MixedLenBuilder::new(MixedLenOptions {
            checksum_level: self.checksum_level,
        });
        for old in new_to_old {
            let mut rec = Vec::new();
            self.get_record_append(old, &mut rec)?;
            b.add_record(&rec);
        }
        write(&b.finish());
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

    #[test]
    fn test_mode_length_split() {
        // Lengths {4,4,4,4,7,4,9}: the mode is 4 with five records.
        let lens = [4usize, 4, 4, 4, 7, 4, 9];
        let records: Vec<Vec<u8>> = lens
            .iter()
            .enumerate()
            .map(|(i, &l)| (0..l).map(|j| (i * 16 + j) as u8).collect())
            .collect();
        let mut b = MixedLenBuilder::new(MixedLenOptions::default());
        for r in &records {
            b.add_record(r);
        }
        let store = MixedLenStore::load(StoreMem::from_vec(b.finish())).unwrap();
        assert_eq!(store.fixed_len(), 4);
        assert_eq!(store.fixed_num(), 5);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r, "record {i}");
        }
    }

    #[test]
    fn test_roundtrip_with_trailers_and_empty() {
        let mut records: Vec<Vec<u8>> = vec![vec![], b"abc".to_vec(), vec![], vec![9; 64]];
        for i in 0..100u8 {
            records.push(vec![i; 8]);
        }
        let mut b = MixedLenBuilder::new(MixedLenOptions { checksum_level: 2 });
        for r in &records {
            b.add_record(r);
        }
        let store = MixedLenStore::load(StoreMem::from_vec(b.finish())).unwrap();
        assert_eq!(store.fixed_len(), 8);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r, "record {i}");
        }
    }

    #[test]
    fn test_reorder() {
        let records: Vec<Vec<u8>> = (0..50)
            .map(|i| vec![i as u8; if i % 3 == 0 { 5 } else { 11 }])
            .collect();
        let mut b = MixedLenBuilder::new(MixedLenOptions::default());
        for r in &records {
            b.add_record(r);
        }
        let store = MixedLenStore::load(StoreMem::from_vec(b.finish())).unwrap();
        let perm: Vec<usize> = (0..records.len()).map(|i| (i * 7) % records.len()).collect();
        let mut out = Vec::new();
        store
            .reorder_zip_data(&mut perm.iter().copied(), &mut |x| out.extend_from_slice(x))
            .unwrap();
        let r2 = MixedLenStore::load(StoreMem::from_vec(out)).unwrap();
        for (new_id, &old_id) in perm.iter().enumerate() {
            assert_eq!(r2.get_record(new_id).unwrap(), records[old_id]);
        }
    }
}
