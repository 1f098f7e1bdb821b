//! Dictionary-zip builder: sampling, dictionary construction, the
//! single-thread and pipelined encoders, the optional entropy second pass,
//! and file assembly.
//!
//! Build flow: samples → (optional sort + dedup) dictionary bytes →
//! suffix array + interval cache → per-record token encoding (inline or
//! through a batch pipeline whose single writer commits in submission
//! order) → optional order-1 Huffman pass over the token streams →
//! offsets, bitmap, table, embedded dictionary, footer.

use super::sa_cache::SuffixDictCache;
use super::token::{G_MIN_LEN, GlobalLayout};
use super::zip::{LocalMatcher, zip_record};
use crate::env;
use crate::format::{FOOTER_SIZE, FileAssembler, HEADER_SIZE, HeaderBase, align16};
use oxizbs_core::crc::Crc32c;
use oxizbs_core::error::{Error, Result};
use oxizbs_core::hist::FreqHistO1;
use oxizbs_core::rank_select::BitVec;
use oxizbs_core::sorted_uint_vec::build_sorted_uints;
use oxizbs_core::uint_vec::{UintVecBuilder, uint_bits};
use oxizbs_core::xxh::{seed, xxhash64};
use oxizbs_entropy::huffman::{HuffmanEncoderO1, NORMALISE};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Class name in file headers.
pub const CLASS_NAME: &str = "DictZipBlobStore";

/// Dictionary cap: one byte under 2 GiB.
pub const MAX_DICT_BYTES: usize = (2 << 30) - 1;

/// Entropy algorithm of the second pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntropyAlgo {
    /// Store token streams raw.
    None,
    /// Order-1 Huffman over the token streams.
    HuffmanO1,
}

/// Sample preprocessing before dictionary concatenation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleSort {
    /// Keep submission order.
    None,
    /// Sort samples lexicographically.
    Left,
    /// Sort samples by reversed bytes.
    Right,
    /// Build both sorted dictionaries and keep the smaller.
    Both,
}

/// Build-time options.
#[derive(Clone)]
pub struct DictZipOptions {
    /// 0: nothing; 1: header/offsets CRC; 2: plus per-record CRC-32C;
    /// 3: as 2 (the file hash is always present and checked at load).
    pub checksum_level: u8,
    /// Local-match probe bound; 0 picks the matcher default (5 for the
    /// hash chain, 30 for the suffix-array matcher).
    pub max_match_probe: usize,
    /// Second-pass entropy coding.
    pub entropy_algo: EntropyAlgo,
    /// Sample preprocessing.
    pub sample_sort: SampleSort,
    /// Per-record suffix-array matcher instead of the hash chain.
    pub use_suffix_array_local_match: bool,
    /// 0 stores offsets bit-packed; 6 or 7 block-compresses them.
    pub offset_block_units: u8,
    /// Huffman interleave of the entropy pass; `None` takes the
    /// environment default.
    pub entropy_interleave: Option<usize>,
    /// Entropy form is kept only under this fraction of the token size.
    pub entropy_zip_ratio: f64,
    /// Embed the dictionary in the store file.
    pub embed_dict: bool,
    /// Pipeline width; `None` consults the environment, 0 builds single
    /// threaded.
    pub threads: Option<usize>,
}

impl Default for DictZipOptions {
    fn default() -> Self {
        Self {
            checksum_level: 1,
            max_match_probe: 0,
            entropy_algo: EntropyAlgo::None,
            sample_sort: SampleSort::None,
            use_suffix_array_local_match: false,
            offset_block_units: 0,
            entropy_interleave: None,
            entropy_zip_ratio: 0.95,
            embed_dict: true,
            threads: None,
        }
    }
}

/// Build timing breakdown, in seconds.
#[derive(Default, Clone, Debug)]
pub struct ZipStat {
    /// Sample collection time.
    pub sample_time: f64,
    /// Suffix array and cache construction time.
    pub dict_build_time: f64,
    /// Token encoding time.
    pub dict_zip_time: f64,
    /// Entropy pass time.
    pub entropy_zip_time: f64,
}

struct Batch {
    seq: u64,
    records: Vec<Vec<u8>>,
}

struct ZippedBatch {
    seq: u64,
    zdata: Vec<u8>,
    lens: Vec<(u32, u32)>,
}

enum Pipeline {
    Single {
        scratch: LocalMatcher,
    },
    Threads {
        work_tx: Option<crossbeam_channel::Sender<Batch>>,
        workers: Vec<JoinHandle<()>>,
        collector: Option<JoinHandle<Result<(Vec<u8>, Vec<(u32, u32)>)>>>,
        batch: Vec<Vec<u8>>,
        batch_bytes: usize,
        batch_limit: usize,
        seq: u64,
    },
}

/// Dictionary-zip store builder.
pub struct DictZipBuilder {
    opts: DictZipOptions,
    probe: usize,
    sample_pool: Vec<u8>,
    samples: Vec<(u32, u32)>,
    dict: Option<Arc<SuffixDictCache>>,
    layout: Option<GlobalLayout>,
    pipeline: Option<Pipeline>,
    zip_data: Vec<u8>,
    rec_lens: Vec<(u32, u32)>,
    unzip_size: u64,
    stat: ZipStat,
}

impl DictZipBuilder {
    /// New builder.
    pub fn new(opts: DictZipOptions) -> Result<Self> {
        if !matches!(opts.offset_block_units, 0 | 6 | 7) {
            return Err(Error::invalid_argument(format!(
                "offset block units {} (want 0, 6 or 7)",
                opts.offset_block_units
            )));
        }
        let probe = if opts.max_match_probe > 0 {
            opts.max_match_probe
        } else {
            env::max_probe(if opts.use_suffix_array_local_match { 30 } else { 5 })
        };
        Ok(Self {
            opts,
            probe,
            sample_pool: Vec::new(),
            samples: Vec::new(),
            dict: None,
            layout: None,
            pipeline: None,
            zip_data: Vec::new(),
            rec_lens: Vec::new(),
            unzip_size: 0,
            stat: ZipStat::default(),
        })
    }

    /// Add one dictionary sample.
    pub fn add_sample(&mut self, bytes: &[u8]) -> Result<()> {
        if self.dict.is_some() {
            return Err(Error::invalid_argument("samples after prepare_dict"));
        }
        if self.sample_pool.len() + bytes.len() > MAX_DICT_BYTES {
            return Err(Error::exhausted("dictionary samples exceed 2 GiB"));
        }
        let at = self.sample_pool.len() as u32;
        self.sample_pool.extend_from_slice(bytes);
        self.samples.push((at, bytes.len() as u32));
        Ok(())
    }

    /// Take a prebuilt dictionary instead of samples.
    pub fn use_sample(&mut self, sample: Vec<u8>) -> Result<()> {
        if sample.len() > MAX_DICT_BYTES {
            return Err(Error::exhausted("dictionary exceeds 2 GiB"));
        }
        self.samples.clear();
        self.sample_pool = sample;
        self.samples.push((0, self.sample_pool.len() as u32));
        Ok(())
    }

    fn sorted_dict(&self, reversed: bool) -> Vec<u8> {
        let pool = &self.sample_pool;
        let mut idx: Vec<(u32, u32)> = self.samples.clone();
        let key = |s: &(u32, u32)| &pool[s.0 as usize..(s.0 + s.1) as usize];
        use rayon::prelude::*;
        if reversed {
            idx.par_sort_unstable_by(|a, b| key(a).iter().rev().cmp(key(b).iter().rev()));
        } else {
            idx.par_sort_unstable_by(|a, b| key(a).cmp(key(b)));
        }
        idx.dedup_by(|a, b| key(a) == key(b));
        let mut out = Vec::with_capacity(pool.len());
        for s in &idx {
            out.extend_from_slice(key(s));
        }
        out
    }

    /// Build the dictionary, its suffix array and interval cache. Called
    /// implicitly by `prepare` when needed.
    pub fn prepare_dict(&mut self) -> Result<()> {
        if self.dict.is_some() {
            return Ok(());
        }
        let t0 = std::time::Instant::now();
        let mut dict = match self.opts.sample_sort {
            SampleSort::None => std::mem::take(&mut self.sample_pool),
            SampleSort::Left => self.sorted_dict(false),
            SampleSort::Right => self.sorted_dict(true),
            SampleSort::Both => {
                // Keep whichever direction dedups smaller; left wins ties.
                let left = self.sorted_dict(false);
                let right = self.sorted_dict(true);
                if right.len() < left.len() { right } else { left }
            }
        };
        self.sample_pool = Vec::new();
        self.samples = Vec::new();
        self.stat.sample_time = t0.elapsed().as_secs_f64();

        // The global-token layout needs a nonempty address space.
        if dict.len() <= G_MIN_LEN + 1 {
            dict.resize(G_MIN_LEN + 2, 0);
        }
        let t1 = std::time::Instant::now();
        let min_freq = if dict.len() >= 1 << 30 { 31 } else { 15 };
        let cache = SuffixDictCache::build(dict, min_freq, 64);
        self.layout = Some(GlobalLayout::new(cache.dict().len()));
        log::debug!(
            "dict-zip dictionary: {} bytes, {} cached intervals",
            cache.dict().len(),
            cache.cache_nodes()
        );
        self.dict = Some(Arc::new(cache));
        self.stat.dict_build_time = t1.elapsed().as_secs_f64();
        Ok(())
    }

    /// Borrow the dictionary bytes (after `prepare_dict`).
    pub fn dictionary(&self) -> Option<&[u8]> {
        self.dict.as_ref().map(|d| d.dict())
    }

    /// Start accepting records. `_expected_records` is advisory.
    pub fn prepare(&mut self, _expected_records: usize) -> Result<()> {
        self.prepare_dict()?;
        let threads = self
            .opts
            .threads
            .or_else(env::zip_threads)
            .unwrap_or_else(|| num_cpus::get().min(8));
        self.pipeline = Some(if threads == 0 {
            Pipeline::Single {
                scratch: LocalMatcher::default(),
            }
        } else {
            self.spawn_pipeline(threads)
        });
        Ok(())
    }

    fn spawn_pipeline(&self, threads: usize) -> Pipeline {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<Batch>(threads * 2);
        let (res_tx, res_rx) = crossbeam_channel::bounded::<ZippedBatch>(threads * 2);
        let dict = Arc::clone(self.dict.as_ref().expect("prepare_dict ran"));
        let layout = self.layout.expect("layout derived with dict");
        let probe = self.probe;
        let use_sa = self.opts.use_suffix_array_local_match;
        let workers = (0..threads)
            .map(|i| {
                let work_rx = work_rx.clone();
                let res_tx = res_tx.clone();
                let dict = Arc::clone(&dict);
                std::thread::Builder::new()
                    .name(format!("oxizbs-dictzip-{i}"))
                    .spawn(move || {
                        let mut scratch = LocalMatcher::default();
                        while let Ok(batch) = work_rx.recv() {
                            let mut zdata = Vec::new();
                            let mut lens = Vec::with_capacity(batch.records.len());
                            for rec in &batch.records {
                                let before = zdata.len();
                                if zip_record(
                                    rec, &dict, &layout, probe, use_sa, &mut scratch, &mut zdata,
                                )
                                .is_err()
                                {
                                    // Records are size-checked on submit;
                                    // keep the stream aligned regardless.
                                    zdata.truncate(before);
                                }
                                lens.push(((zdata.len() - before) as u32, rec.len() as u32));
                            }
                            if res_tx
                                .send(ZippedBatch {
                                    seq: batch.seq,
                                    zdata,
                                    lens,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    })
                    .expect("spawn dict-zip worker")
            })
            .collect();
        drop(res_tx);
        // Single writer: reassemble submission order.
        let collector = std::thread::Builder::new()
            .name("oxizbs-dictzip-writer".into())
            .spawn(move || -> Result<(Vec<u8>, Vec<(u32, u32)>)> {
                let mut zip_data = Vec::new();
                let mut rec_lens = Vec::new();
                let mut next = 0u64;
                let mut held: BTreeMap<u64, ZippedBatch> = BTreeMap::new();
                while let Ok(zb) = res_rx.recv() {
                    held.insert(zb.seq, zb);
                    while let Some(zb) = held.remove(&next) {
                        zip_data.extend_from_slice(&zb.zdata);
                        rec_lens.extend_from_slice(&zb.lens);
                        next += 1;
                    }
                }
                if !held.is_empty() {
                    return Err(Error::corrupted_at_unknown("pipeline lost a batch"));
                }
                Ok((zip_data, rec_lens))
            })
            .expect("spawn dict-zip writer");
        Pipeline::Threads {
            work_tx: Some(work_tx),
            workers,
            collector: Some(collector),
            batch: Vec::new(),
            batch_bytes: 0,
            batch_limit: env::batch_buffer_size(),
            seq: 0,
        }
    }

    /// Append one record.
    pub fn add_record(&mut self, rec: &[u8]) -> Result<()> {
        if rec.len() >= u32::MAX as usize {
            return Err(Error::invalid_argument("record too large"));
        }
        self.unzip_size += rec.len() as u64;
        let dict = Arc::clone(
            self.dict
                .as_ref()
                .ok_or_else(|| Error::invalid_argument("add_record before prepare"))?,
        );
        let layout = self.layout.expect("layout derived with dict");
        let probe = self.probe;
        let use_sa = self.opts.use_suffix_array_local_match;
        match self
            .pipeline
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("add_record before prepare"))?
        {
            Pipeline::Single { scratch } => {
                let before = self.zip_data.len();
                zip_record(rec, &dict, &layout, probe, use_sa, scratch, &mut self.zip_data)?;
                self.rec_lens
                    .push(((self.zip_data.len() - before) as u32, rec.len() as u32));
                Ok(())
            }
            Pipeline::Threads {
                work_tx,
                batch,
                batch_bytes,
                batch_limit,
                seq,
                ..
            } => {
                batch.push(rec.to_vec());
                *batch_bytes += rec.len();
                if *batch_bytes >= *batch_limit || batch.len() >= 4096 {
                    let records = std::mem::take(batch);
                    *batch_bytes = 0;
                    let b = Batch { seq: *seq, records };
                    *seq += 1;
                    work_tx
                        .as_ref()
                        .expect("pipeline running")
                        .send(b)
                        .map_err(|_| Error::corrupted_at_unknown("pipeline worker died"))?;
                }
                Ok(())
            }
        }
    }

    /// Discard all state without producing a file.
    pub fn abandon(self) {}

    /// Timing breakdown so far.
    pub fn stat(&self) -> &ZipStat {
        &self.stat
    }

    /// Drain the pipeline, run the entropy pass, and assemble the file.
    /// Returns the file image and, when the dictionary is not embedded,
    /// the dictionary bytes to keep alongside it.
    pub fn finish(mut self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let t0 = std::time::Instant::now();
        match self.pipeline.take() {
            Some(Pipeline::Single { .. }) => {}
            Some(Pipeline::Threads {
                mut work_tx,
                workers,
                mut collector,
                batch,
                seq,
                ..
            }) => {
                if !batch.is_empty() {
                    work_tx
                        .as_ref()
                        .expect("pipeline running")
                        .send(Batch { seq, records: batch })
                        .map_err(|_| Error::corrupted_at_unknown("pipeline worker died"))?;
                }
                work_tx.take();
                for w in workers {
                    w.join()
                        .map_err(|_| Error::corrupted_at_unknown("dict-zip worker panicked"))?;
                }
                let (zip_data, rec_lens) = collector
                    .take()
                    .expect("collector running")
                    .join()
                    .map_err(|_| Error::corrupted_at_unknown("dict-zip writer panicked"))??;
                self.zip_data = zip_data;
                self.rec_lens = rec_lens;
            }
            None => return Err(Error::invalid_argument("finish before prepare")),
        }
        self.stat.dict_zip_time = t0.elapsed().as_secs_f64();

        let dict = self.dict.take().expect("prepare ran");
        let records = self.rec_lens.len();
        let interleave = self
            .opts
            .entropy_interleave
            .unwrap_or_else(env::entropy_interleave);

        // Entropy pass: re-encode every token stream through one order-1
        // table and keep the shorter form per record.
        let t1 = std::time::Instant::now();
        let mut entropy: Option<(BitVec, Vec<u8>)> = None;
        let mut payload = Vec::new();
        let mut spans: Vec<u32> = Vec::with_capacity(records);
        if self.opts.entropy_algo == EntropyAlgo::HuffmanO1 {
            let mut freq = FreqHistO1::all();
            let mut at = 0usize;
            for &(zlen, _) in &self.rec_lens {
                freq.add_record(&self.zip_data[at..at + zlen as usize]);
                at += zlen as usize;
            }
            freq.finish();
            freq.normalise(NORMALISE);
            let enc = HuffmanEncoderO1::new(freq.histogram());
            let mut bitmap = BitVec::new();
            let mut kept = 0usize;
            let mut at = 0usize;
            for &(zlen, _) in &self.rec_lens {
                let span = &self.zip_data[at..at + zlen as usize];
                at += zlen as usize;
                let packed = enc.encode_interleaved(span, interleave);
                let win = (packed.len() as f64) < span.len() as f64 * self.opts.entropy_zip_ratio;
                bitmap.push(win);
                let body = if win { &packed[..] } else { span };
                payload.extend_from_slice(body);
                if win {
                    kept += 1;
                }
                Self::push_span(
                    &mut payload,
                    &mut spans,
                    body.len(),
                    self.opts.checksum_level,
                );
            }
            log::debug!("entropy pass kept {kept}/{records} records");
            entropy = Some((bitmap, enc.table().to_vec()));
        } else {
            let mut at = 0usize;
            for &(zlen, _) in &self.rec_lens {
                let span = &self.zip_data[at..at + zlen as usize];
                at += zlen as usize;
                payload.extend_from_slice(span);
                Self::push_span(&mut payload, &mut spans, span.len(), self.opts.checksum_level);
            }
        }
        self.stat.entropy_zip_time = t1.elapsed().as_secs_f64();
        self.zip_data = Vec::new();

        let mut offsets = Vec::with_capacity(records + 1);
        let mut acc = 0u64;
        offsets.push(0u64);
        for &s in &spans {
            acc += s as u64;
            offsets.push(acc);
        }
        debug_assert_eq!(acc as usize, payload.len());

        let dict_bytes = dict.dict();
        let dict_hash = xxhash64(dict_bytes, seed::BLOB_STORE);
        let file = assemble_file(&AssembleInput {
            payload: &payload,
            offsets: &offsets,
            offset_block_units: self.opts.offset_block_units,
            records: records as u64,
            unzip_size: self.unzip_size,
            entropy: entropy
                .as_ref()
                .map(|(bm, table)| (bm, &table[..], interleave)),
            checksum_level: self.opts.checksum_level,
            dict_len: dict_bytes.len(),
            dict_hash,
            embed_dict: self.opts.embed_dict.then_some(dict_bytes),
        });
        let external = if self.opts.embed_dict {
            None
        } else {
            Some(dict_bytes.to_vec())
        };
        Ok((file, external))
    }

    /// Append the per-record CRC trailer and record the stored span.
    fn push_span(payload: &mut Vec<u8>, spans: &mut Vec<u32>, body_len: usize, level: u8) {
        if level >= 2 {
            let crc = Crc32c::compute(&payload[payload.len() - body_len..]);
            payload.extend_from_slice(&crc.to_le_bytes());
            spans.push(body_len as u32 + 4);
        } else {
            spans.push(body_len as u32);
        }
    }
}

/// Everything the file writer needs, shared by the builder and the
/// reorder/purge transforms.
pub(crate) struct AssembleInput<'a> {
    pub payload: &'a [u8],
    pub offsets: &'a [u64],
    pub offset_block_units: u8,
    pub records: u64,
    pub unzip_size: u64,
    pub entropy: Option<(&'a BitVec, &'a [u8], usize)>,
    pub checksum_level: u8,
    pub dict_len: usize,
    pub dict_hash: u64,
    pub embed_dict: Option<&'a [u8]>,
}

/// Bitmap section image: one bit per record, 16-byte padded.
pub(crate) fn bitmap_section(bitmap: &BitVec) -> Vec<u8> {
    let mut b = bitmap.to_bytes();
    b.resize(align16(b.len().max(bitmap.len().div_ceil(64) * 8)), 0);
    b
}

pub(crate) fn assemble_file(inp: &AssembleInput<'_>) -> Vec<u8> {
    let (offset_bytes, offsets_uint_bits) = if inp.offset_block_units == 0 {
        let bits = uint_bits(*inp.offsets.last().unwrap_or(&0));
        let mut b = UintVecBuilder::with_width(bits);
        for &o in inp.offsets {
            b.push(o);
        }
        (b.into_bytes(), bits as u8)
    } else {
        (
            build_sorted_uints(inp.offsets, inp.offset_block_units),
            0u8,
        )
    };

    let bitmap_bytes = inp
        .entropy
        .map(|(bm, _, _)| bitmap_section(bm))
        .unwrap_or_default();
    let table_len = inp.entropy.map(|(_, t, _)| t.len()).unwrap_or(0);
    let dict_block = inp.embed_dict.map(|d| align16(d.len())).unwrap_or(0);

    let mut base = HeaderBase::new(CLASS_NAME, 1);
    base.records = inp.records;
    base.unzip_size = inp.unzip_size;
    base.global_dict_size = inp.dict_len as u64;
    base.file_size = (HEADER_SIZE
        + align16(inp.payload.len())
        + align16(offset_bytes.len())
        + bitmap_bytes.len()
        + align16(table_len)
        + dict_block
        + FOOTER_SIZE) as u64;

    let mut header = [0u8; HEADER_SIZE];
    header[..80].copy_from_slice(&base.to_bytes());
    header[80..88].copy_from_slice(&(offset_bytes.len() as u64).to_le_bytes());
    header[88..96].copy_from_slice(&(align16(inp.payload.len()) as u64).to_le_bytes());
    if let Some(d) = inp.embed_dict {
        let pad = (align16(d.len()) - d.len()) as u8;
        header[96] = 1 | (pad << 4);
    }
    header[100..104].copy_from_slice(&(table_len as u32).to_le_bytes());
    header[104] = offsets_uint_bits;
    header[105] = inp.checksum_level;
    header[106] = if inp.entropy.is_some() { 1 } else { 0 };
    let ilv = inp.entropy.map(|(_, _, n)| n).unwrap_or(1);
    header[107] =
        1 | ((ilv.trailing_zeros() as u8) << 1) | (inp.offset_block_units << 4);
    if let Some((bm, table, _)) = inp.entropy {
        let mut crc = Crc32c::update(0, &bitmap_section(bm));
        crc = Crc32c::update(crc, table);
        header[108..112].copy_from_slice(&crc.to_le_bytes());
    }
    header[112..120].copy_from_slice(&inp.dict_hash.to_le_bytes());
    header[120..124].copy_from_slice(&Crc32c::compute(&offset_bytes).to_le_bytes());
    let hcrc = Crc32c::compute(&header[..124]);
    header[124..128].copy_from_slice(&hcrc.to_le_bytes());

    let mut a = FileAssembler::new(seed::DICT_ZIP);
    a.write(&header);
    a.write(inp.payload);
    a.pad16();
    a.write(&offset_bytes);
    a.pad16();
    a.write(&bitmap_bytes);
    a.write(inp.entropy.map(|(_, t, _)| t).unwrap_or(&[]));
    a.pad16();
    if let Some(d) = inp.embed_dict {
        a.write(d);
        a.pad16();
    }
    a.finish()
}
