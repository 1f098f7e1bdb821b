//! Entropy-zip store: whole-corpus Huffman coding with bit-aligned records.
//!
//! One shared code table covers every record; record boundaries are *bit*
//! offsets kept in a `SortedUintVec`. Order-0 or order-1 coding is chosen
//! by entropy estimate (order-1 wins when `est_o0·15/16 >= est_o1`), and
//! the order-1 codec may run any interleave. At checksum level >= 2 a
//! 16-bit CRC of the raw record rides in the stream after the record bits.
//!
//! Header extension (bytes 80..128):
//!
//! ```text
//! [content_bits u64][offsets_bytes u64][log2_block_units u8][order u8]
//! [checksum_level u8][flags u8][pad; 4][table_bytes u64][pad; 16]
//! ```
//!
//! `flags` bit 0: table stored raw (not nested-compressed); bits 1-2:
//! log2 of the order-1 interleave. Files of format version 0 always carry
//! a raw table. Content and table are packed adjacent and padded together.

use crate::env;
use crate::format::{FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, align16, validate_file};
use crate::store::{BlobStore, CacheOffsets, RecordSource};
use oxizbs_core::bits::EntropyBits;
use oxizbs_core::crc::Crc16;
use oxizbs_core::error::{Error, Result};
use oxizbs_core::hist::{FreqHist, FreqHistO1, Histogram};
use oxizbs_core::mem::StoreMem;
use oxizbs_core::sorted_uint_vec::{SortedUintVecView, build_sorted_uints};
use oxizbs_core::uint_vec::{get_bits, put_bits};
use oxizbs_core::xxh::{checksum_verify_enabled, seed};
use oxizbs_entropy::huffman::{
    HuffmanDecoder, HuffmanDecoderO1, HuffmanEncoder, HuffmanEncoderO1, NORMALISE,
};

/// Class name in file headers.
pub const CLASS_NAME: &str = "EntropyZipBlobStore";

const FLAG_RAW_TABLE: u8 = 1;

/// Build-time options.
#[derive(Clone, Copy)]
pub struct EntropyZipOptions {
    /// >= 2 embeds a per-record CRC-16 in the bit stream.
    pub checksum_level: u8,
    /// Offset block size log2: 6 or 7.
    pub log2_block_units: u8,
    /// Order-1 interleave (1, 2, 4 or 8); `None` takes the environment
    /// default.
    pub interleave: Option<usize>,
    /// Store the code table raw for faster open.
    pub raw_table: bool,
}

impl Default for EntropyZipOptions {
    fn default() -> Self {
        Self {
            checksum_level: 1,
            log2_block_units: 7,
            interleave: None,
            raw_table: false,
        }
    }
}

/// Append bit spans onto a growing byte buffer, LSB-first.
#[derive(Default)]
struct BitAppender {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitAppender {
    fn append_span(&mut self, span: EntropyBits<'_>) {
        let mut done = 0;
        while done < span.len {
            let n = (span.len - done).min(56);
            let v = get_bits(span.data, span.skip + done, n);
            self.append_value(v, n);
            done += n;
        }
    }

    fn append_value(&mut self, v: u64, n: usize) {
        let need = (self.bits + n).div_ceil(8);
        if self.bytes.len() < need {
            self.bytes.resize(need, 0);
        }
        put_bits(&mut self.bytes, self.bits, v, n);
        self.bits += n;
    }
}

enum Codec {
    O0(HuffmanEncoder),
    O1(HuffmanEncoderO1, usize),
}

/// Builder: buffers records, then runs the frequency pass and encodes the
/// whole corpus through one table.
pub struct EntropyZipBuilder {
    opts: EntropyZipOptions,
    records: Vec<Vec<u8>>,
}

impl EntropyZipBuilder {
    /// New builder.
    pub fn new(opts: EntropyZipOptions) -> Self {
        Self {
            opts,
            records: Vec::new(),
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, rec: &[u8]) {
        self.records.push(rec.to_vec());
    }

    /// Run the frequency pass, encode, and serialize the store file.
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut freq = FreqHistO1::all();
        for r in &self.records {
            freq.add_record(r);
        }
        freq.finish();
        let est_o1 = FreqHistO1::estimate_size(freq.histogram());
        let est_o0 = {
            let h = Histogram {
                o0_size: freq.histogram().o0_size,
                o0: freq.histogram().o0,
            };
            FreqHist::estimate_size(&h)
        };
        freq.normalise(NORMALISE);

        let interleave = self.opts.interleave.unwrap_or_else(env::entropy_interleave);
        let codec = if est_o0 * 15 / 16 < est_o1 {
            let h = Histogram {
                o0_size: freq.histogram().o0_size,
                o0: freq.histogram().o0,
            };
            Codec::O0(HuffmanEncoder::new(&h))
        } else {
            Codec::O1(
                HuffmanEncoderO1::with_table_compression(freq.histogram(), !self.opts.raw_table),
                interleave,
            )
        };

        let mut content = BitAppender::default();
        let mut offsets = vec![0u64];
        let mut unzip = 0u64;
        for r in &self.records {
            let bits = match &codec {
                Codec::O0(e) => e.bitwise_encode(r),
                Codec::O1(e, 1) => e.bitwise_encode_x1(r),
                Codec::O1(e, 2) => e.bitwise_encode_xn::<2>(r),
                Codec::O1(e, 4) => e.bitwise_encode_xn::<4>(r),
                Codec::O1(e, 8) => e.bitwise_encode_xn::<8>(r),
                Codec::O1(_, n) => {
                    return Err(Error::invalid_argument(format!("interleave {n}")));
                }
            };
            content.append_span(bits.as_bits());
            if self.opts.checksum_level >= 2 {
                content.append_value(Crc16::compute(r) as u64, 16);
            }
            offsets.push(content.bits as u64);
            unzip += r.len() as u64;
        }

        let (order, table, ilv) = match codec {
            Codec::O0(e) => (0u8, e.table().to_vec(), 1usize),
            Codec::O1(e, n) => (1u8, e.table().to_vec(), n),
        };
        let offset_bytes = build_sorted_uints(&offsets, self.opts.log2_block_units);

        let mut base = HeaderBase::new(CLASS_NAME, 1);
        base.records = self.records.len() as u64;
        base.unzip_size = unzip;
        let body = align16(content.bytes.len() + table.len());
        base.file_size = (HEADER_SIZE + body + align16(offset_bytes.len()) + FOOTER_SIZE) as u64;

        let mut flags = 0u8;
        if self.opts.raw_table {
            flags |= FLAG_RAW_TABLE;
        }
        flags |= (ilv.trailing_zeros() as u8) << 1;

        let mut header = [0u8; HEADER_SIZE];
        header[..80].copy_from_slice(&base.to_bytes());
        header[80..88].copy_from_slice(&(content.bits as u64).to_le_bytes());
        header[88..96].copy_from_slice(&(offset_bytes.len() as u64).to_le_bytes());
        header[96] = self.opts.log2_block_units;
        header[97] = order;
        header[98] = self.opts.checksum_level;
        header[99] = flags;
        header[104..112].copy_from_slice(&(table.len() as u64).to_le_bytes());

        let mut a = FileAssembler::new(seed::ENTROPY_ZIP);
        a.write(&header);
        a.write(&content.bytes);
        a.write(&table);
        a.pad16();
        a.write(&offset_bytes);
        a.pad16();
        Ok(a.finish())
    }
}

enum Decoder {
    O0(HuffmanDecoder),
    O1(HuffmanDecoderO1, usize),
}

/// Loaded entropy-zip store.
pub struct EntropyZipStore {
    mem: StoreMem,
    records: usize,
    unzip_size: u64,
    content_bits: u64,
    content_off: usize,
    offsets_off: usize,
    offsets_len: usize,
    checksum_level: u8,
    decoder: Decoder,
}

impl EntropyZipStore {
    /// Load, validate, and parse the code table.
    pub fn load(mem: StoreMem) -> Result<Self> {
        let base = validate_file(mem.as_slice(), CLASS_NAME, seed::ENTROPY_ZIP)?;
        let data = mem.as_slice();
        let ext = &data[80..HEADER_SIZE];
        let content_bits = u64::from_le_bytes(ext[0..8].try_into().unwrap());
        let offsets_bytes = u64::from_le_bytes(ext[8..16].try_into().unwrap()) as usize;
        let order = ext[17];
        let checksum_level = ext[18];
        let flags = ext[19];
        let table_bytes = u64::from_le_bytes(ext[24..32].try_into().unwrap()) as usize;

        let content_off = HEADER_SIZE;
        let content_len = (content_bits as usize).div_ceil(8);
        let table_off = content_off + content_len;
        let offsets_off = content_off + align16(content_len + table_bytes);
        if offsets_off + offsets_bytes + FOOTER_SIZE > data.len() {
            return Err(Error::corrupted(80, "sections exceed file size"));
        }
        let table = &data[table_off..table_off + table_bytes];
        let interleave = 1usize << ((flags >> 1) & 3);
        let decoder = match order {
            0 => Decoder::O0(HuffmanDecoder::from_table(table)?.0),
            1 => Decoder::O1(HuffmanDecoderO1::from_table(table)?.0, interleave),
            v => return Err(Error::corrupted(97, format!("bad entropy order {v}"))),
        };
        let store = Self {
            mem,
            records: base.records as usize,
            unzip_size: base.unzip_size,
            content_bits,
            content_off,
            offsets_off,
            offsets_len: offsets_bytes,
            checksum_level,
            decoder,
        };
        if store.offsets()?.len() != store.records + 1 {
            return Err(Error::corrupted(88, "offset index length mismatch"));
        }
        Ok(store)
    }

    fn content(&self) -> &[u8] {
        let len = (self.content_bits as usize).div_ceil(8);
        &self.mem.as_slice()[self.content_off..self.content_off + len]
    }

    fn offsets(&self) -> Result<SortedUintVecView<'_>> {
        SortedUintVecView::new(
            &self.mem.as_slice()[self.offsets_off..self.offsets_off + self.offsets_len],
        )
        .ok_or_else(|| Error::corrupted(self.offsets_off as u64, "bad offset index"))
    }

    fn crc_bits(&self) -> usize {
        if self.checksum_level >= 2 { 16 } else { 0 }
    }

}

/// Registry loader.
pub fn load_boxed(mem: StoreMem) -> Result<Box<dyn BlobStore>> {
    Ok(Box::new(EntropyZipStore::load(mem)?))
}

impl BlobStore for EntropyZipStore {
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
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets()?.get2(id);
        self.decode_window(self.content(), a, b, out)
    }

    fn get_record_append_cached(&self, id: usize, co: &mut CacheOffsets) -> Result<()> {
        if id >= self.records {
            return Err(Error::invalid_argument(format!("record id {id} out of range")));
        }
        let (a, b) = self.offsets()?.get2_cached(id, &mut co.block);
        let mut out = std::mem::take(&mut co.rec_data);
        let r = self.decode_window(self.content(), a, b, &mut out);
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
        if b < a || b > self.content_bits {
            return Err(Error::corrupted(80, "bit offsets out of order"));
        }
        let byte_a = (a / 8) as usize;
        let byte_b = b.div_ceil(8) as usize;
        let bytes = src.read_at(
            base_offset + (self.content_off + byte_a) as u64,
            byte_b - byte_a,
            rdbuf,
        )?;
        let body = bytes.to_vec();
        // Spans are relative to the fetched window, not the whole content.
        let shift = (byte_a * 8) as u64;
        self.decode_window(&body, a - shift, b - shift, out)
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
        let mut content = BitAppender::default();
        let mut offs = vec![0u64];
        let mut unzip = 0u64;
        for old in new_to_old {
            if old >= self.records {
                return Err(Error::invalid_argument(format!("record id {old} out of range")));
            }
            let (a, b) = offsets.get2(old);
            // Verify and size the record while copying its span verbatim.
            let mut rec = Vec::new();
            self.decode_window(self.content(), a, b, &mut rec)?;
            unzip += rec.len() as u64;
            content.append_span(EntropyBits {
                data: self.content(),
                skip: a as usize,
                len: (b - a) as usize,
            });
            offs.push(content.bits as u64);
        }
        self.write_rebuilt(content, offs, unzip, write)
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

impl EntropyZipStore {
    fn decode_window(&self, window: &[u8], begin: u64, end: u64, out: &mut Vec<u8>) -> Result<()> {
        if end < begin || end as usize > window.len() * 8 {
            return Err(Error::corrupted(80, "bit offsets out of order"));
        }
        let total = (end - begin) as usize;
        if total < self.crc_bits() {
            return Err(Error::corrupted(80, "record span shorter than its checksum"));
        }
        let len = total - self.crc_bits();
        let bits = EntropyBits {
            data: window,
            skip: begin as usize,
            len,
        };
        let before = out.len();
        match &self.decoder {
            Decoder::O0(d) => d.bitwise_decode(bits, out)?,
            Decoder::O1(d, 1) => d.bitwise_decode_x1(bits, out)?,
            Decoder::O1(d, 2) => d.bitwise_decode_xn::<2>(bits, out)?,
            Decoder::O1(d, 4) => d.bitwise_decode_xn::<4>(bits, out)?,
            Decoder::O1(d, 8) => d.bitwise_decode_xn::<8>(bits, out)?,
            Decoder::O1(_, n) => {
                return Err(Error::corrupted(99, format!("bad interleave {n}")));
            }
        }
        if self.crc_bits() > 0 && checksum_verify_enabled() {
            let expect = get_bits(window, (begin as usize) + len, 16) as u16;
            let got = Crc16::compute(&out[before..]);
            if got != expect {
                return Err(Error::bad_checksum("crc16", expect as u64, got as u64));
            }
        }
        Ok(())
    }

    fn write_rebuilt(
        &self,
        content: BitAppender,
        offs: Vec<u64>,
        unzip: u64,
        write: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let data = self.mem.as_slice();
        let ext = &data[80..HEADER_SIZE];
        let table_bytes = u64::from_le_bytes(ext[24..32].try_into().unwrap()) as usize;
        let old_content_len = (self.content_bits as usize).div_ceil(8);
        let table = &data[self.content_off + old_content_len
            ..self.content_off + old_content_len + table_bytes];
        let log2_units = ext[16];
        let offset_bytes = build_sorted_uints(&offs, log2_units);

        let mut base = HeaderBase::new(CLASS_NAME, 1);
        base.records = offs.len() as u64 - 1;
        base.unzip_size = unzip;
        let body = align16(content.bytes.len() + table.len());
        base.file_size = (HEADER_SIZE + body + align16(offset_bytes.len()) + FOOTER_SIZE) as u64;

        let mut header = [0u8; HEADER_SIZE];
        header[..80].copy_from_slice(&base.to_bytes());
        header[80..88].copy_from_slice(&(content.bits as u64).to_le_bytes());
        header[88..96].copy_from_slice(&(offset_bytes.len() as u64).to_le_bytes());
        header[96] = log2_units;
        header[97] = ext[17];
        header[98] = self.checksum_level;
        header[99] = ext[19];
        header[104..112].copy_from_slice(&(table.len() as u64).to_le_bytes());

        let mut a = FileAssembler::new(seed::ENTROPY_ZIP);
        a.write(&header);
        a.write(&content.bytes);
        a.write(table);
        a.pad16();
        a.write(&offset_bytes);
        a.pad16();
        write(&a.finish());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<Vec<u8>> {
        let mut v = vec![
            b"".to_vec(),
            b"entropy".to_vec(),
            b"the quick brown fox jumps over the lazy dog".repeat(4),
            vec![3u8; 200],
        ];
        for i in 0..800usize {
            v.push(format!("record-{i:04}-{}", "payload ".repeat(i % 9)).into_bytes());
        }
        v
    }

    fn build(opts: EntropyZipOptions) -> (Vec<Vec<u8>>, EntropyZipStore) {
        let records = sample_records();
        let mut b = EntropyZipBuilder::new(opts);
        for r in &records {
            b.add_record(r);
        }
        let file = b.finish().unwrap();
        let store = EntropyZipStore::load(StoreMem::from_vec(file)).unwrap();
        (records, store)
    }

    #[test]
    fn test_roundtrip_default() {
        let (records, store) = build(EntropyZipOptions::default());
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r, "record {i}");
        }
    }

    #[test]
    fn test_roundtrip_every_interleave_and_crc() {
        for ilv in [1usize, 2, 4, 8] {
            let (records, store) = build(EntropyZipOptions {
                checksum_level: 2,
                log2_block_units: 6,
                interleave: Some(ilv),
                raw_table: false,
            });
            let mut co = CacheOffsets::default();
            for (i, r) in records.iter().enumerate() {
                store.get_record_cached(i, &mut co).unwrap();
                assert_eq!(&co.rec_data, r, "interleave {ilv}, record {i}");
            }
        }
    }

    #[test]
    fn test_raw_table_flag() {
        let (records, store) = build(EntropyZipOptions {
            raw_table: true,
            ..Default::default()
        });
        assert_eq!(&store.get_record(2).unwrap(), &records[2]);
    }

    #[test]
    fn test_compresses_text() {
        let (records, store) = build(EntropyZipOptions::default());
        let raw: usize = records.iter().map(|r| r.len()).sum();
        assert!(store.mem_size() < raw, "{} vs {raw}", store.mem_size());
    }

    #[test]
    fn test_reorder() {
        let (records, store) = build(EntropyZipOptions {
            checksum_level: 2,
            ..Default::default()
        });
        let n = records.len();
        let perm: Vec<usize> = (0..n).map(|i| (i * 13) % n).collect();
        assert_eq!(
            {
                let mut s = perm.clone();
                s.sort();
                s
            },
            (0..n).collect::<Vec<_>>(),
            "permutation must be a bijection"
        );
        let mut out = Vec::new();
        store
            .reorder_zip_data(&mut perm.iter().copied(), &mut |b| out.extend_from_slice(b))
            .unwrap();
        let r2 = EntropyZipStore::load(StoreMem::from_vec(out)).unwrap();
        for (new_id, &old_id) in perm.iter().enumerate() {
            assert_eq!(r2.get_record(new_id).unwrap(), records[old_id]);
        }
    }
}
