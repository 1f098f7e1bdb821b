//! Loaded dictionary-zip store: validation, record reads, and the
//! reorder/purge rewriters.

use super::builder::{AssembleInput, CLASS_NAME, assemble_file};
use super::token::GlobalLayout;
use super::unzip::{unzip, unzip_delayed};
use crate::env;
use crate::format::{FOOTER_SIZE, HEADER_SIZE, align16, validate_file};
use crate::store::{BlobStore, CacheOffsets, RecordSource};
use oxizbs_core::crc::Crc32c;
use oxizbs_core::error::{Error, Result};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::rank_select::BitVec;
use oxizbs_core::sorted_uint_vec::SortedUintVecView;
use oxizbs_core::uint_vec::{UintVecView, compute_mem_size, get_bits};
use oxizbs_core::xxh::{checksum_verify_enabled, seed, xxhash64};
use oxizbs_entropy::huffman::HuffmanDecoderO1;

type UnzipFn = fn(&[u8], &mut Vec<u8>, &[u8], &GlobalLayout, usize) -> Result<()>;

enum DictMem {
    Embedded { off: usize, len: usize },
    External(Vec<u8>),
}

enum OffsetsFlavor {
    Packed { bits: usize },
    Sorted,
}

struct EntropyPart {
    bitmap_off: usize,
    decoder: HuffmanDecoderO1,
    interleave: usize,
    table_off: usize,
    table_len: usize,
}

/// Loaded dictionary-zip store.
pub struct DictZipStore {
    mem: StoreMem,
    dict: DictMem,
    records: usize,
    unzip_size: u64,
    payload_len: usize,
    offsets_off: usize,
    offsets_len: usize,
    offsets_flavor: OffsetsFlavor,
    entropy: Option<EntropyPart>,
    checksum_level: u8,
    layout: GlobalLayout,
    unzip_fn: UnzipFn,
    reserve_mult: usize,
    block_units: u8,
    detached_offsets: Option<Vec<u8>>,
    detached_entropy_meta: Option<Vec<u8>>,
}

impl DictZipStore {
    /// Load a store whose dictionary is embedded in the file.
    pub fn load(mem: StoreMem) -> Result<Self> {
        Self::load_impl(mem, None)
    }

    /// Load a store with a caller-supplied dictionary (external form).
    pub fn load_with_dict(mem: StoreMem, dict: Vec<u8>) -> Result<Self> {
        Self::load_impl(mem, Some(dict))
    }

    fn load_impl(mem: StoreMem, external_dict: Option<Vec<u8>>) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::DICT_ZIP)?;
        let data = mem.as_slice();
        let h = &data[..HEADER_SIZE];
        if checksum_verify_enabled() {
            let expect = u32::from_le_bytes(h[124..128].try_into().unwrap());
            let got = Crc32c::compute(&h[..124]);
            if got != expect {
                return Err(Error::bad_checksum("crc32c", expect as u64, got as u64));
            }
        }
        let offset_array_bytes = u64::from_le_bytes(h[80..88].try_into().unwrap()) as usize;
        let ptr_list_bytes = u64::from_le_bytes(h[88..96].try_into().unwrap()) as usize;
        let embed = h[96] & 0xF;
        let table_len = u32::from_le_bytes(h[100..104].try_into().unwrap()) as usize;
        let offsets_uint_bits = h[104] as usize;
        let checksum_level = h[105];
        let entropy_algo = h[106];
        let flags = h[107];
        let interleave = 1usize << ((flags >> 1) & 3);
        let block_units = flags >> 4;
        let records = base.records as usize;
        let dict_len = base.global_dict_size as usize;

        let offsets_off = HEADER_SIZE + ptr_list_bytes;
        let bitmap_off = offsets_off + align16(offset_array_bytes);
        let bitmap_len = if entropy_algo != 0 {
            align16(records.div_ceil(64) * 8)
        } else {
            0
        };
        let table_off = bitmap_off + bitmap_len;
        let dict_off = align16(table_off + table_len);
        let dict_block = match embed {
            0 => 0,
            1 => align16(dict_len),
            2 => {
                return Err(Error::not_implemented("compressed embedded dictionary"));
            }
            v => return Err(Error::corrupted(96, format!("bad embedded dict type {v}"))),
        };
        if dict_off + dict_block + FOOTER_SIZE > data.len() {
            return Err(Error::corrupted(80, "sections exceed file size"));
        }
        if checksum_verify_enabled() {
            let expect = u32::from_le_bytes(h[120..124].try_into().unwrap());
            let got = Crc32c::compute(&data[offsets_off..offsets_off + offset_array_bytes]);
            if got != expect {
                return Err(Error::bad_checksum("crc32c", expect as u64, got as u64));
            }
            if entropy_algo != 0 {
                let expect = u32::from_le_bytes(h[108..112].try_into().unwrap());
                let mut crc = Crc32c::update(0, &data[bitmap_off..bitmap_off + bitmap_len]);
                crc = Crc32c::update(crc, &data[table_off..table_off + table_len]);
                if crc != expect {
                    return Err(Error::bad_checksum("crc32c", expect as u64, crc as u64));
                }
            }
        }

        let dict = match embed {
            1 => {
                if external_dict.is_some() {
                    return Err(Error::invalid_argument(
                        "dictionary supplied but the file embeds one",
                    ));
                }
                DictMem::Embedded {
                    off: dict_off,
                    len: dict_len,
                }
            }
            _ => {
                let d = external_dict.ok_or_else(|| {
                    Error::invalid_argument("store needs its external dictionary")
                })?;
                if d.len() != dict_len {
                    return Err(Error::invalid_argument(format!(
                        "dictionary is {} bytes, header says {}",
                        d.len(),
                        dict_len
                    )));
                }
                DictMem::External(d)
            }
        };
        {
            let bytes = match &dict {
                DictMem::Embedded { off, len } => &data[*off..*off + *len],
                DictMem::External(d) => &d[..],
            };
            if checksum_verify_enabled() {
                let expect = u64::from_le_bytes(h[112..120].try_into().unwrap());
                let got = xxhash64(bytes, seed::BLOB_STORE);
                if got != expect {
                    return Err(Error::bad_checksum("xxh64", expect, got));
                }
            }
        }

        let offsets_flavor = if block_units == 0 {
            if compute_mem_size(offsets_uint_bits, records + 1) > offset_array_bytes {
                return Err(Error::corrupted(80, "offset index shorter than declared"));
            }
            OffsetsFlavor::Packed {
                bits: offsets_uint_bits,
            }
        } else {
            OffsetsFlavor::Sorted
        };
        let entropy = if entropy_algo == 1 {
            let (decoder, _) = HuffmanDecoderO1::from_table(&data[table_off..table_off + table_len])?;
            Some(EntropyPart {
                bitmap_off,
                decoder,
                interleave,
                table_off,
                table_len,
            })
        } else if entropy_algo != 0 {
            return Err(Error::not_implemented("unknown entropy algorithm"));
        } else {
            None
        };

        let dict_len_for_layout = dict_len.max(super::token::G_MIN_LEN + 2);
        let mut me = Self {
            mem,
            dict,
            records,
            unzip_size: base.unzip_size,
            payload_len: 0,
            offsets_off,
            offsets_len: offset_array_bytes,
            offsets_flavor,
            entropy,
            checksum_level,
            layout: GlobalLayout::new(dict_len_for_layout),
            unzip_fn: if env::unzip_impl() == 2 {
                unzip_delayed
            } else {
                unzip
            },
            reserve_mult: 5,
            block_units,
            detached_offsets: None,
            detached_entropy_meta: None,
        };
        me.payload_len = me.offset_at(records)? as usize;
        if me.payload_len > ptr_list_bytes {
            return Err(Error::corrupted(88, "payload runs past its section"));
        }
        Ok(me)
    }

    fn dict_bytes(&self) -> &[u8] {
        match &self.dict {
            DictMem::Embedded { off, len } => &self.mem.as_slice()[*off..*off + *len],
            DictMem::External(d) => d,
        }
    }

    fn offsets_bytes(&self) -> &[u8] {
        match &self.detached_offsets {
            Some(v) => v,
            None => &self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len],
        }
    }

    /// The entropy meta block (bitmap then table), override-aware.
    fn entropy_meta_bytes(&self) -> Option<&[u8]> {
        let e = self.entropy.as_ref()?;
        Some(match &self.detached_entropy_meta {
            Some(v) => v,
            None => &self.mem.as_slice()[e.bitmap_off..e.table_off + e.table_len],
        })
    }

    /// The dictionary bytes.
    pub fn dict(&self) -> &[u8] {
        self.dict_bytes()
    }

    fn offset_at(&self, i: usize) -> Result<u64> {
        match self.offsets_flavor {
            OffsetsFlavor::Packed { bits } => {
                Ok(UintVecView::new(self.offsets_bytes(), bits, self.records + 1).get(i))
            }
            OffsetsFlavor::Sorted => {
                let v = SortedUintVecView::new(self.offsets_bytes())
                    .ok_or_else(|| Error::corrupted(self.offsets_off as u64, "bad offset index"))?;
                Ok(v.get(i))
            }
        }
    }

    fn offset_pair(&self, id: usize, cache: Option<&mut CacheOffsets>) -> Result<(u64, u64)> {
        match self.offsets_flavor {
            OffsetsFlavor::Packed { bits } => {
                Ok(UintVecView::new(self.offsets_bytes(), bits, self.records + 1).get2(id))
            }
            OffsetsFlavor::Sorted => {
                let v = SortedUintVecView::new(self.offsets_bytes())
                    .ok_or_else(|| Error::corrupted(self.offsets_off as u64, "bad offset index"))?;
                Ok(match cache {
                    Some(co) => v.get2_cached(id, &mut co.block),
                    None => v.get2(id),
                })
            }
        }
    }

    fn entropy_flag(&self, id: usize) -> bool {
        match self.entropy_meta_bytes() {
            Some(meta) => get_bits(meta, id, 1) != 0,
            None => false,
        }
    }

    /// Verify the span's trailer and inflate it into `out`.
    fn read_span(&self, id: usize, span: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let body = if self.checksum_level >= 2 {
            if span.len() < 4 {
                return Err(Error::corrupted(0, "record shorter than its checksum"));
            }
            let (body, tail) = span.split_at(span.len() - 4);
            if checksum_verify_enabled() {
                let expect = u32::from_le_bytes(tail.try_into().unwrap());
                let got = Crc32c::compute(body);
                if got != expect {
                    return Err(Error::bad_checksum("crc32c", expect as u64, got as u64));
                }
            }
            body
        } else {
            span
        };
        if self.entropy_flag(id) {
            let e = self.entropy.as_ref().expect("flag implies entropy part");
            let mut tokens = Vec::with_capacity(body.len() * 2);
            e.decoder
                .decode_interleaved(body, e.interleave, &mut tokens)?;
            (self.unzip_fn)(&tokens, out, self.dict_bytes(), &self.layout, self.reserve_mult)
        } else {
            (self.unzip_fn)(body, out, self.dict_bytes(), &self.layout, self.reserve_mult)
        }
    }

    fn span_bounds(&self, id: usize, a: u64, b: u64) -> Result<(usize, usize)> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        if b < a || b as usize > self.payload_len {
            return Err(Error::corrupted(
                self.offsets_off as u64,
                "offset index out of order",
            ));
        }
        Ok((a as usize, b as usize))
    }

    fn rebuild(
        &self,
        ids: &mut dyn Iterator<Item = usize>,
        force_packed: bool,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let data = self.mem.as_slice();
        let mut payload = Vec::new();
        let mut offsets = vec![0u64];
        let mut bitmap = self.entropy.as_ref().map(|_| BitVec::new());
        let mut unzip_size = 0u64;
        for old in ids {
            let (a, b) = self.offset_pair(old, None)?;
            let (a, b) = self.span_bounds(old, a, b)?;
            let span = &data[HEADER_SIZE + a..HEADER_SIZE + b];
            // Count the record's decoded size while validating it.
            let mut tmp = Vec::new();
            self.read_span(old, span, &mut tmp)?;
            unzip_size += tmp.len() as u64;
            payload.extend_from_slice(span);
            offsets.push(payload.len() as u64);
            if let Some(bm) = &mut bitmap {
                bm.push(self.entropy_flag(old));
            }
        }
        let table = self.entropy.as_ref().map(|e| {
            let meta = self.entropy_meta_bytes().expect("entropy meta present");
            let table_at = e.table_off - e.bitmap_off;
            (&meta[table_at..table_at + e.table_len], e.interleave)
        });
        let entropy = match (&bitmap, table) {
            (Some(bm), Some((t, ilv))) => Some((bm, t, ilv)),
            _ => None,
        };
        let dict_bytes = self.dict_bytes();
        let file = assemble_file(&AssembleInput {
            payload: &payload,
            offsets: &offsets,
            offset_block_units: if force_packed { 0 } else { self.block_units },
            records: (offsets.len() - 1) as u64,
            unzip_size,
            entropy,
            checksum_level: self.checksum_level,
            dict_len: dict_bytes.len(),
            dict_hash: xxhash64(dict_bytes, seed::BLOB_STORE),
            embed_dict: matches!(self.dict, DictMem::Embedded { .. }).then_some(dict_bytes),
        });
        write(&file);
        Ok(())
    }
}

/// Registry loader (embedded-dictionary files only).
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(DictZipStore::load(mem)?))
}

impl BlobStore for DictZipStore {
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
            + match &self.dict {
                DictMem::External(d) => d.len(),
                DictMem::Embedded { .. } => 0,
            }
    }

    fn get_record_append(&self, id: usize, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offset_pair(id, None)?;
        let (a, b) = self.span_bounds(id, a, b)?;
        let span = &self.mem.as_slice()[HEADER_SIZE + a..HEADER_SIZE + b];
        self.read_span(id, span, out)
    }

    fn get_record_append_cached(&self, id: usize, co: &mut CacheOffsets) -> Result<()> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offset_pair(id, Some(co))?;
        let (a, b) = self.span_bounds(id, a, b)?;
        let span = &self.mem.as_slice()[HEADER_SIZE + a..HEADER_SIZE + b];
        let mut out = std::mem::take(&mut co.rec_data);
        let r = self.read_span(id, span, &mut out);
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
        let (a, b) = self.offset_pair(id, None)?;
        let (a, b) = self.span_bounds(id, a, b)?;
        let bytes = src.read_at(base_offset + (HEADER_SIZE + a) as u64, b - a, rdbuf)?;
        let span = bytes.to_vec();
        self.read_span(id, &span, out)
    }

    fn get_meta_blocks(&self) -> Vec<&[u8]> {
        let mut v = vec![self.offsets_bytes()];
        if let Some(meta) = self.entropy_meta_bytes() {
            v.push(meta);
        }
        v
    }

    fn detach_meta_blocks(&mut self, blocks: Vec<Vec<u8>>) -> Result<()> {
        let want = 1 + self.entropy.is_some() as usize;
        if blocks.len() != want {
            return Err(Error::invalid_argument(format!(
                "expected {want} meta blocks, got {}",
                blocks.len()
            )));
        }
        let mut it = blocks.into_iter();
        let offsets = it.next().expect("length checked");
        if offsets.len() != self.offsets_len {
            return Err(Error::invalid_argument(format!(
                "offsets block is {} bytes, expected {}",
                offsets.len(),
                self.offsets_len
            )));
        }
        self.detached_offsets = Some(offsets);
        if let Some(e) = &self.entropy {
            let meta = it.next().expect("length checked");
            let expect = e.table_off + e.table_len - e.bitmap_off;
            if meta.len() != expect {
                return Err(Error::invalid_argument(format!(
                    "entropy block is {} bytes, expected {expect}",
                    meta.len()
                )));
            }
            self.detached_entropy_meta = Some(meta);
        }
        Ok(())
    }

    fn get_data_blocks(&self) -> Vec<&[u8]> {
        vec![&self.mem.as_slice()[HEADER_SIZE..HEADER_SIZE + self.payload_len]]
    }

    fn reorder_zip_data(
        &self,
        new_to_old: &mut dyn Iterator<Item = usize>,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        self.rebuild(new_to_old, false, write)
    }

    fn purge_zip_data(
        &self,
        is_del: &dyn Fn(usize) -> bool,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut survivors = (0..self.records).filter(|&i| !is_del(i));
        self.rebuild(&mut survivors, true, write)
    }
}
