//! Zip-offset store: raw record bodies with a block-compressed offset index.
//!
//! Same payload as the plain store, but the offsets are a `SortedUintVec`
//! so huge corpora of small records pay ~1 byte per record of index instead
//! of several. Optionally each record carries a CRC trailer (CRC-32C or
//! CRC-16 by header checksum type, at checksum level >= 2).
//!
//! The format reserves a flag for per-record compressed bodies; this
//! implementation never writes it and declines files that set it.
//!
//! Header extension (bytes 80..128):
//!
//! ```text
//! [content_bytes u64][offsets_bytes u64][log2_block_units u8]
//! [checksum_level u8][body_compressed u8][pad; 21]
//! ```

use crate::format::{
    ChecksumType, FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, align16, validate_file,
};
use crate::store::{BlobStore, CacheOffsets, RecordSource};
use oxizbs_core::crc::{Crc16, Crc32c};
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::sorted_uint_vec::{SortedUintVecView, build_sorted_uints};
use oxizbs_core::xxh::{checksum_verify_enabled, seed};

/// Class name in file headers.
pub const CLASS_NAME: &str = "ZipOffsetBlobStore";

/// Build-time options.
#[derive(Clone, Copy)]
pub struct ZipOffsetOptions {
    /// 0 or 1: no record trailers; >= 2: CRC trailer per record.
    pub checksum_level: u8,
    /// Trailer flavor.
    pub checksum_type: ChecksumType,
    /// Offset block size log2: 6 or 7.
    pub log2_block_units: u8,
}

impl Default for ZipOffsetOptions {
    fn default() -> Self {
        Self {
            checksum_level: 1,
            checksum_type: ChecksumType::Crc32c,
            log2_block_units: 7,
        }
    }
}

fn trailer_len(level: u8, ty: ChecksumType) -> usize {
    if level >= 2 {
        match ty {
            ChecksumType::Crc32c => 4,
            ChecksumType::Crc16 => 2,
        }
    } else {
        0
    }
}

/// Builder: appends records (plus optional CRC trailers) and compresses
/// the offsets at the end.
pub struct ZipOffsetBuilder {
    opts: ZipOffsetOptions,
    content: Vec<u8>,
    offsets: Vec<u64>,
    unzip_size: u64,
}

impl ZipOffsetBuilder {
    /// New builder.
    pub fn new(opts: ZipOffsetOptions) -> Self {
        Self {
            opts,
            content: Vec::new(),
            offsets: vec![0],
            unzip_size: 0,
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, rec: &[u8]) {
        self.content.extend_from_slice(rec);
        if self.opts.checksum_level >= 2 {
            match self.opts.checksum_type {
                ChecksumType::Crc32c => self
                    .content
                    .extend_from_slice(&Crc32c::compute(rec).to_le_bytes()),
                ChecksumType::Crc16 => self
                    .content
                    .extend_from_slice(&Crc16::compute(rec).to_le_bytes()),
            }
        }
        self.offsets.push(self.content.len() as u64);
        self.unzip_size += rec.len() as u64;
    }

    /// Serialize the store file.
    pub fn finish(self) -> Vec<u8> {
        build_file(
            &self.content,
            &self.offsets,
            self.unzip_size,
            self.opts.checksum_level,
            self.opts.checksum_type,
            self.opts.log2_block_units,
        )
    }
}

fn build_file(
    content: &[u8],
    offsets: &[u64],
    unzip_size: u64,
    checksum_level: u8,
    checksum_type: ChecksumType,
    log2_units: u8,
) -> Vec<u8> {
    let offset_bytes = build_sorted_uints(offsets, log2_units);

    let mut base = HeaderBase::new(CLASS_NAME, 1);
    base.records = offsets.len() as u64 - 1;
    base.unzip_size = unzip_size;
    base.checksum_type = checksum_type;
    base.file_size =
        (HEADER_SIZE + align16(content.len()) + align16(offset_bytes.len()) + FOOTER_SIZE) as u64;

    let mut header = [0u8; HEADER_SIZE];
    header[..80].copy_from_slice(&base.to_bytes());
    header[80..88].copy_from_slice(&(content.len() as u64).to_le_bytes());
    header[88..96].copy_from_slice(&(offset_bytes.len() as u64).to_le_bytes());
    header[96] = log2_units;
    header[97] = checksum_level;
    header[98] = 0; // body_compressed: never written by this implementation

    let mut a = FileAssembler::new(seed::BLOB_STORE);
    a.write(&header);
    a.write(content);
    a.pad16();
    a.write(&offset_bytes);
    a.pad16();
    a.finish()
}

/// Loaded zip-offset store.
pub struct ZipOffsetStore {
    mem: StoreMem,
    records: usize,
    unzip_size: u64,
    content_bytes: usize,
    offsets_off: usize,
    offsets_len: usize,
    checksum_level: u8,
    checksum_type: ChecksumType,
}

impl ZipOffsetStore {
    /// Load and validate.
    pub fn load(mem: StoreMem) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::BLOB_STORE)?;
        let data = mem.as_slice();
        let ext = &data[80..HEADER_SIZE];
        let content_bytes = u64::from_le_bytes(ext[0..8].try_into().unwrap()) as usize;
        let offsets_bytes = u64::from_le_bytes(ext[8..16].try_into().unwrap()) as usize;
        let checksum_level = ext[17];
        if ext[18] != 0 {
            return Err(Error::not_implemented(
                "zip-offset per-record compressed bodies",
            ));
        }
        let offsets_off = HEADER_SIZE + align16(content_bytes);
        if offsets_off + offsets_bytes + FOOTER_SIZE > data.len() {
            return Err(Error::corrupted(80, "sections exceed file size"));
        }
        let store = Self {
            mem,
            records: base.records as usize,
            unzip_size: base.unzip_size,
            content_bytes,
            offsets_off,
            offsets_len: offsets_bytes,
            checksum_level,
            checksum_type: base.checksum_type,
        };
        if store.offsets()?.len() != store.records + 1 {
            return Err(Error::corrupted(88, "offset index length mismatch"));
        }
        Ok(store)
    }

    fn content(&self) -> &[u8] {
        &self.mem.as_slice()[HEADER_SIZE..HEADER_SIZE + self.content_bytes]
    }

    fn offsets(&self) -> Result<SortedUintVecView<'_>> {
        SortedUintVecView::new(
            &self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len],
        )
        .ok_or_else(|| Error::corrupted(self.offsets_off as u64, "bad offset index"))
    }

    fn trailer(&self) -> usize {
        trailer_len(self.checksum_level, self.checksum_type)
    }

    fn check_and_append(&self, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let t = self.trailer();
        if body.len() < t {
            return Err(Error::corrupted(0, "record shorter than its trailer"));
        }
        let (rec, tail) = body.split_at(body.len() - t);
        if t > 0 && checksum_verify_enabled() {
            match self.checksum_type {
                ChecksumType::Crc32c => {
                    let expect = u32::from_le_bytes(tail.try_into().unwrap());
                    let got = Crc32c::compute(rec);
                    if got != expect {
                        return Err(Error::bad_checksum("crc32c", expect as u64, got as u64));
                    }
                }
                ChecksumType::Crc16 => {
                    let expect = u16::from_le_bytes(tail.try_into().unwrap());
                    let got = Crc16::compute(rec);
                    if got != expect {
                        return Err(Error::bad_checksum("crc16", expect as u64, got as u64));
                    }
                }
            }
        }
        out.extend_from_slice(rec);
        Ok(())
    }

    fn span(&self, id: usize, a: u64, b: u64) -> Result<(usize, usize)> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        if b < a || b as usize > self.content_bytes {
            return Err(Error::corrupted(self.offsets_off as u64, "offset index out of order"));
        }
        Ok((a as usize, b as usize))
    }
}

/// Registry loader.
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(ZipOffsetStore::load(mem)?))
}

impl BlobStore for ZipOffsetStore {
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
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets()?.get2(id);
        let (a, b) = self.span(id, a, b)?;
        self.check_and_append(&self.content()[a..b], out)
    }

    fn get_record_append_cached(&self, id: usize, co: &mut CacheOffsets) -> Result<()> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets()?.get2_cached(id, &mut co.block);
        let (a, b) = self.span(id, a, b)?;
        let mut out = std::mem::take(&mut co.rec_data);
        let r = self.check_and_append(&self.content()[a..b], &mut out);
        co.rec_data = out;
        r
    }

    fn fspread_record_append(
        &self,
        src: &mut dyn RecordSource,
        base_offset: u64,
        id: usize,
        out: &mut Vec<u8>,
        rdbuf: &mut Vec<u8>,
    ) -> Result<()> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets()?.get2(id);
        let (a, b) = self.span(id, a, b)?;
        let bytes = src.read_at(base_offset + (HEADER_SIZE + a) as u64, b - a, rdbuf)?;
        // Borrow rules: copy out of the scratch before verifying appends.
        let body = bytes.to_vec();
        self.check_and_append(&body, out)
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        vec![&self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len]]
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        vec![self.content()]
    }

    fn reorder_zip_data(
        &self,
        new_to_old: &mut dyn Iterator<Item = usize>,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let offsets = self.offsets()?;
        let t = self.trailer();
        let mut content = Vec::with_capacity(self.content_bytes);
        let mut offs = vec![0u64];
        let mut unzip = 0u64;
        for old in new_to_old {
            let (a, b) = offsets.get2(old);
            let (a, b) = self.span(old, a, b)?;
            content.extend_from_slice(&self.content()[a..b]);
            offs.push(content.len() as u64);
            unzip += (b - a - t) as u64;
        }
        write(&build_file(
            &content,
            &offs,
            unzip,
            self.checksum_level,
            self.checksum_type,
            offsets.log2_block_units(),
        ));
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
        (0..300usize)
            .map(|i| {
                let len = (i * 7) % 40;
                (0..len).map(|j| ((i + j) % 251) as u8).collect()
            })
            .collect()
    }

    fn build(opts: ZipOffsetOptions) -> (Vec<Vec<u8>>, ZipOffsetStore) {
        let records = sample_records();
        let mut b = ZipOffsetBuilder::new(opts);
        for r in &records {
            b.add_record(r);
        }
        let store = ZipOffsetStore::load(StoreMem::from_vec(b.finish())).unwrap();
        (records, store)
    }

    #[test]
    fn test_roundtrip_plain_level() {
        let (records, store) = build(ZipOffsetOptions::default());
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r);
        }
    }

    #[test]
    fn test_roundtrip_with_crc_trailers() {
        for ty in [ChecksumType::Crc32c, ChecksumType::Crc16] {
            let (records, store) = build(ZipOffsetOptions {
                checksum_level: 2,
                checksum_type: ty,
                log2_block_units: 6,
            });
            let mut co = CacheOffsets::default();
            for (i, r) in records.iter().enumerate() {
                store.get_record_cached(i, &mut co).unwrap();
                assert_eq!(&co.rec_data, r, "record {i} with {ty:?}");
            }
            let total: u64 = records.iter().map(|r| r.len() as u64).sum();
            assert_eq!(store.total_data_size(), total);
        }
    }

    #[test]
    fn test_corrupt_record_detected() {
        let (_, store) = build(ZipOffsetOptions {
            checksum_level: 2,
            checksum_type: ChecksumType::Crc32c,
            log2_block_units: 7,
        });
        // Rebuild the file with one payload byte flipped and the footer
        // hash recomputed, so only the record CRC can catch it.
        let mut raw = {
            let mut b = ZipOffsetBuilder::new(ZipOffsetOptions {
                checksum_level: 2,
                checksum_type: ChecksumType::Crc32c,
                log2_block_units: 7,
            });
            for r in sample_records() {
                b.add_record(&r);
            }
            b.finish()
        };
        // Record 1 starts after record 0 (0 bytes) + its trailer.
        raw[HEADER_SIZE + 4 + 2] ^= 0x55;
        // Fix up the file hash so the frame check passes.
        let body_len = raw.len() - FOOTER_SIZE;
        let h = oxizbs_core::xxh::xxhash64(&raw[..body_len], seed::BLOB_STORE);
        raw[body_len + 8..body_len + 16].copy_from_slice(&h.to_le_bytes());
        let bad = ZipOffsetStore::load(StoreMem::from_vec(raw)).unwrap();
        assert!(matches!(
            bad.get_record(1),
            Err(Error::BadChecksum { .. })
        ));
        drop(store);
    }

    #[test]
    fn test_reorder_reverse() {
        let (records, store) = build(ZipOffsetOptions {
            checksum_level: 2,
            checksum_type: ChecksumType::Crc16,
            log2_block_units: 7,
        });
        let perm: Vec<usize> = (0..records.len()).rev().collect();
        let mut out = Vec::new();
        store
            .reorder_zip_data(&mut perm.iter().copied(), &mut |b| out.extend_from_slice(b))
            .unwrap();
        let r2 = ZipOffsetStore::load(StoreMem::from_vec(out)).unwrap();
        for (new_id, &old_id) in perm.iter().enumerate() {
            assert_eq!(r2.get_record(new_id).unwrap(), records[old_id]);
        }
    }
}
