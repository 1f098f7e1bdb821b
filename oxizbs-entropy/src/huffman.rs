//! Canonical Huffman coding, order-0 and order-1, with interleaved decoding.
//!
//! Code lengths are capped at [`BLOCK_BITS`] so a decoder can always resolve
//! the next symbol from a 12-bit window of its state. The order-0 codec runs
//! a single state machine; the order-1 codec conditions each symbol on the
//! previous byte (context 256 for a record's first symbol) and offers
//! 1/2/4/8-way interleaved streams, where N independent lane states decode
//! bit-parallel and refill from the shared stream in 52-bit chunks.
//!
//! Encoding always runs right-to-left through a [`ReverseBitWriter`], so the
//! decoder consumes the stream strictly forward.

use oxizbs_core::bits::{
    BitReader, EntropyBits, EntropyBitsOwned, ReverseBitWriter, bytes_to_bits,
};
use oxizbs_core::error::{Error, Result};
use oxizbs_core::hist::{FreqHist, Histogram, HistogramO1};

/// Decoder window width; no code word exceeds this many bits.
pub const BLOCK_BITS: usize = 12;
/// Refill chunk width for interleaved streams.
pub const HEADER_BLOCK_BITS: usize = 64 - BLOCK_BITS;
/// Histogram total used when a corpus is large enough to need rescaling.
pub const NORMALISE: usize = 1 << 15;

const TABLE_SIZE: usize = 1 << BLOCK_BITS;
/// First-symbol context of the order-1 codec.
const CTX0: usize = 256;

/// One symbol's canonical code.
#[derive(Clone, Copy, Default)]
struct EncSym {
    bits: u16,
    bit_count: u16,
}

#[inline]
fn bsr(v: u64) -> u32 {
    debug_assert!(v != 0);
    63 - v.leading_zeros()
}

// ---------------------------------------------------------------------------
// Table construction

#[derive(Clone, Copy, Default)]
struct BuildItem {
    count: u32,
    parent: u16,
    data: u8,
    bit_count: u8,
}

/// Bucket sort of the 256 symbols by descending count. `node` is the
/// 1-based node array (index 0 is the phantom sentinel).
fn build_sort(node: &mut [BuildItem], count: &[u64; 256]) {
    let mut base = [0u32; 32];
    let mut current = [0u32; 32];
    for n in 0..256 {
        let r = bsr(count[n] + 1) as usize;
        base[r] += 1;
    }
    for n in (1..=30).rev() {
        base[n - 1] += base[n];
    }
    current.copy_from_slice(&base);
    for n in 0..256 {
        let c = count[n] as u32;
        let r = bsr(c as u64 + 1) as usize + 1;
        let mut pos = current[r] as usize;
        current[r] += 1;
        while pos > base[r] as usize && c > node[pos - 1].count {
            node[pos] = node[pos - 1];
            pos -= 1;
        }
        node[pos].count = c;
        node[pos].data = n as u8;
    }
}

/// Lift over-long codes back to [`BLOCK_BITS`], repaying the exact integer
/// cost by demoting the cheapest shorter symbols.
fn set_max_height(arr: &mut [BuildItem; 514], last_nonnull: usize) {
    let node = |arr: &[BuildItem; 514], i: usize| arr[1 + i];
    let max_bits = node(arr, last_nonnull).bit_count as u32;
    if max_bits <= BLOCK_BITS as u32 {
        return;
    }
    let mut total: i64 = 0;
    let base_value = 1i64 << (max_bits - BLOCK_BITS as u32);
    let mut n = last_nonnull;
    while arr[1 + n].bit_count as usize > BLOCK_BITS {
        total += base_value - (1i64 << (max_bits - arr[1 + n].bit_count as u32));
        arr[1 + n].bit_count = BLOCK_BITS as u8;
        n -= 1;
    }
    while arr[1 + n].bit_count as usize == BLOCK_BITS {
        n -= 1;
    }
    total >>= max_bits - BLOCK_BITS as u32;

    const EMPTY: u32 = 0xF0F0_F0F0;
    let mut rank_last = [EMPTY; BLOCK_BITS + 2];
    let mut current_bits = BLOCK_BITS as u32;
    let mut pos = n as i64;
    while pos >= 0 {
        let bc = arr[1 + pos as usize].bit_count as u32;
        if bc < current_bits {
            current_bits = bc;
            rank_last[BLOCK_BITS - bc as usize] = pos as u32;
        }
        pos -= 1;
    }

    while total > 0 {
        let mut dec = (bsr(total as u64) + 1) as usize;
        while dec > 1 {
            let high = rank_last[dec];
            let low = rank_last[dec - 1];
            if high != EMPTY {
                if low == EMPTY {
                    break;
                }
                if arr[1 + high as usize].count <= 2 * arr[1 + low as usize].count {
                    break;
                }
            }
            dec -= 1;
        }
        while dec <= BLOCK_BITS && rank_last[dec] == EMPTY {
            dec += 1;
        }
        debug_assert!(rank_last[dec] != EMPTY);
        total -= 1i64 << (dec - 1);
        if rank_last[dec - 1] == EMPTY {
            rank_last[dec - 1] = rank_last[dec];
        }
        arr[1 + rank_last[dec] as usize].bit_count += 1;
        if rank_last[dec] == 0 {
            rank_last[dec] = EMPTY;
        } else {
            rank_last[dec] -= 1;
            if arr[1 + rank_last[dec] as usize].bit_count as usize != BLOCK_BITS - dec {
                rank_last[dec] = EMPTY;
            }
        }
    }
    while total < 0 {
        if rank_last[1] == EMPTY {
            while arr[1 + n].bit_count as usize == BLOCK_BITS {
                n -= 1;
            }
            arr[1 + n + 1].bit_count -= 1;
            rank_last[1] = (n + 1) as u32;
            total += 1;
            continue;
        }
        arr[1 + rank_last[1] as usize + 1].bit_count -= 1;
        rank_last[1] += 1;
        total += 1;
    }
}

/// Build the canonical code table for one 256-symbol alphabet; when `out`
/// is given, also append the run-length serialized frequency table.
fn build_ctable(freq: &[u64; 256], syms: &mut [EncSym; 256], mut out: Option<&mut Vec<u8>>) {
    let mut arr = [BuildItem::default(); 514];
    *syms = [EncSym::default(); 256];
    build_sort(&mut arr[1..513], freq);
    arr[0].count = 1u32 << 31;

    let mut null_rank = 255usize;
    while arr[1 + null_rank].count == 0 {
        if null_rank == 0 {
            // Empty alphabet: nothing to code.
            if let Some(out) = out.as_deref_mut() {
                out.push(0);
            }
            return;
        }
        null_rank -= 1;
    }

    // Create parents. Indexes below are signed offsets into the 1-based
    // array so the sentinel at arr[0] can act as a phantom lowest symbol.
    let mut low_s = null_rank as i64;
    let mut node_nb = 256i64;
    let node_root = node_nb + low_s - 1;
    let mut low_n = node_nb;
    arr[(1 + node_nb) as usize].count =
        arr[(1 + low_s) as usize].count + arr[low_s as usize].count;
    arr[(1 + low_s) as usize].parent = node_nb as u16;
    arr[low_s as usize].parent = node_nb as u16;
    node_nb += 1;
    low_s -= 2;
    let mut k = node_nb;
    while k <= node_root {
        arr[(1 + k) as usize].count = 1u32 << 30;
        k += 1;
    }
    while node_nb <= node_root {
        let n1 = if arr[(1 + low_s) as usize].count < arr[(1 + low_n) as usize].count {
            let v = low_s;
            low_s -= 1;
            v
        } else {
            let v = low_n;
            low_n += 1;
            v
        };
        let n2 = if arr[(1 + low_s) as usize].count < arr[(1 + low_n) as usize].count {
            let v = low_s;
            low_s -= 1;
            v
        } else {
            let v = low_n;
            low_n += 1;
            v
        };
        arr[(1 + node_nb) as usize].count =
            arr[(1 + n1) as usize].count + arr[(1 + n2) as usize].count;
        arr[(1 + n1) as usize].parent = node_nb as u16;
        arr[(1 + n2) as usize].parent = node_nb as u16;
        node_nb += 1;
    }

    // Distribute unbounded code lengths, then cap them.
    arr[(1 + node_root) as usize].bit_count = 0;
    let mut n = node_root - 1;
    while n >= 256 {
        let p = arr[(1 + n) as usize].parent as usize;
        arr[(1 + n) as usize].bit_count = arr[1 + p].bit_count + 1;
        n -= 1;
    }
    for n in 0..=null_rank {
        let p = arr[1 + n].parent as usize;
        arr[1 + n].bit_count = arr[1 + p].bit_count + 1;
    }
    set_max_height(&mut arr, null_rank);

    // Canonical assignment: starting value per length, then per-symbol
    // codes in byte order.
    let mut count_per_rank = [0u16; BLOCK_BITS + 1];
    let mut start_per_rank = [0u16; BLOCK_BITS + 1];
    for n in 0..=null_rank {
        count_per_rank[arr[1 + n].bit_count as usize] += 1;
    }
    let mut min = 0u16;
    for n in (1..=BLOCK_BITS).rev() {
        start_per_rank[n] = min;
        min += count_per_rank[n];
        min >>= 1;
    }
    for n in 0..=null_rank {
        syms[arr[1 + n].data as usize].bit_count = arr[1 + n].bit_count as u16;
    }
    for n in 0..256 {
        let bc = syms[n].bit_count as usize;
        syms[n].bits = start_per_rank[bc];
        start_per_rank[bc] += 1;
    }

    if let Some(out) = out {
        write_freq_rle(freq, out);
    }
}

/// Serialize nonzero frequencies with run-length coded symbol indexes.
fn write_freq_rle(freq: &[u64; 256], out: &mut Vec<u8>) {
    let mut rle = 0usize;
    for j in 0..256usize {
        if freq[j] == 0 {
            continue;
        }
        if rle > 0 {
            rle -= 1;
        } else {
            out.push(j as u8);
            if j > 0 && freq[j - 1] != 0 {
                let mut k = j + 1;
                while k < 256 && freq[k] != 0 {
                    k += 1;
                }
                rle = k - j - 1;
                out.push(rle as u8);
            }
        }
        let f = freq[j];
        debug_assert!(f < 1 << 15);
        if f < 128 {
            out.push(f as u8);
        } else {
            out.push(128 | (f >> 8) as u8);
            out.push((f & 0xFF) as u8);
        }
    }
    out.push(0);
}

struct Cur<'a> {
    d: &'a [u8],
    i: usize,
}

impl<'a> Cur<'a> {
    fn u8(&mut self) -> Result<u8> {
        let v = *self
            .d
            .get(self.i)
            .ok_or_else(|| Error::corrupted(self.i as u64, "truncated code table"))?;
        self.i += 1;
        Ok(v)
    }

    fn peek(&self) -> Result<u8> {
        self.d
            .get(self.i)
            .copied()
            .ok_or_else(|| Error::corrupted(self.i as u64, "truncated code table"))
    }
}

/// Parse one run-length frequency table.
fn read_freq_rle(cur: &mut Cur<'_>) -> Result<[u64; 256]> {
    let mut freq = [0u64; 256];
    let mut rle = 0usize;
    let mut j = cur.u8()? as usize;
    loop {
        let mut f = cur.u8()? as u64;
        if f >= 128 {
            f = ((f & 127) << 8) | cur.u8()? as u64;
        }
        freq[j] = f;
        if rle == 0 && j + 1 == cur.peek()? as usize {
            j = cur.u8()? as usize;
            rle = cur.u8()? as usize;
        } else if rle > 0 {
            rle -= 1;
            j += 1;
        } else {
            j = cur.u8()? as usize;
        }
        if j == 0 {
            break;
        }
        if j > 255 {
            return Err(Error::corrupted(cur.i as u64, "bad symbol index"));
        }
    }
    Ok(freq)
}

/// Populate a decode table (`ari`: window -> symbol, `cnt`: symbol -> code
/// length) from canonical codes.
fn build_dtable(syms: &[EncSym; 256], ari: &mut [u8], cnt: &mut [u8; 256]) {
    debug_assert_eq!(ari.len(), TABLE_SIZE);
    #[derive(Clone, Copy, Default)]
    struct Item {
        bits: u16,
        bit_count: u8,
        data: u8,
    }
    let mut items = [Item::default(); 256];
    let mut n = 0usize;
    for j in 0..256 {
        if syms[j].bit_count == 0 {
            continue;
        }
        items[n] = Item {
            bits: syms[j].bits << (BLOCK_BITS - syms[j].bit_count as usize),
            bit_count: syms[j].bit_count as u8,
            data: j as u8,
        };
        n += 1;
    }
    if n == 0 {
        return;
    }
    items[..n].sort_by_key(|it| it.bits);
    for k in 0..n - 1 {
        cnt[items[k].data as usize] = items[k].bit_count;
        ari[items[k].bits as usize..items[k + 1].bits as usize].fill(items[k].data);
    }
    let last = items[n - 1];
    cnt[last.data as usize] = last.bit_count;
    ari[last.bits as usize..TABLE_SIZE].fill(last.data);
}

/// Parse a serialized frequency table and build decode tables from it.
fn read_dtable(cur: &mut Cur<'_>, ari: &mut [u8], cnt: &mut [u8; 256]) -> Result<()> {
    let freq = read_freq_rle(cur)?;
    let mut syms = [EncSym::default(); 256];
    build_ctable(&freq, &mut syms, None);
    build_dtable(&syms, ari, cnt);
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared state machinery

#[derive(Clone, Copy, Default)]
struct HufState {
    bits: u64,
    bit_count: usize,
}

#[inline]
fn put_symbol(st: &mut HufState, sym: EncSym) {
    debug_assert!(sym.bit_count > 0, "symbol without a code");
    st.bits = (st.bits >> sym.bit_count) | (u64::from(sym.bits) << (64 - sym.bit_count));
    st.bit_count += sym.bit_count as usize;
}

/// Single-state encode loop shared by the order-0 and order-1 x1 paths.
fn encode_x1_loop(record: &[u8], sym_at: impl Fn(usize) -> EncSym) -> EntropyBitsOwned {
    let mut w = ReverseBitWriter::with_capacity(record.len() * 5 / 4 + 8);
    let mut st = HufState::default();
    for i in (0..record.len()).rev() {
        put_symbol(&mut st, sym_at(i));
        if st.bit_count >= HEADER_BLOCK_BITS {
            st.bit_count -= HEADER_BLOCK_BITS;
            w.write(st.bits << st.bit_count, HEADER_BLOCK_BITS);
        }
    }
    if st.bit_count > 0 {
        w.write(st.bits, st.bit_count);
    }
    w.finish()
}

// ---------------------------------------------------------------------------
// Order-0 codec

/// Order-0 canonical Huffman encoder.
pub struct HuffmanEncoder {
    syms: [EncSym; 256],
    table: Vec<u8>,
}

impl HuffmanEncoder {
    /// Build codes from a finished order-0 histogram. Frequencies must fit
    /// 15 bits; normalise large corpora to [`NORMALISE`] first.
    pub fn new(hist: &Histogram) -> Self {
        let mut syms = [EncSym::default(); 256];
        let mut table = Vec::with_capacity(257 * 3);
        if hist.o0_size == 0 {
            table.push(0);
        } else {
            table.push(1);
            build_ctable(&hist.o0, &mut syms, Some(&mut table));
        }
        Self { syms, table }
    }

    /// The serialized code table understood by [`HuffmanDecoder::from_table`].
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    /// Encode into a self-framing byte string.
    pub fn encode(&self, record: &[u8]) -> Vec<u8> {
        self.bitwise_encode(record).into_bytes()
    }

    /// Encode into a raw bit span.
    pub fn bitwise_encode(&self, record: &[u8]) -> EntropyBitsOwned {
        encode_x1_loop(record, |i| self.syms[record[i] as usize])
    }
}

/// Order-0 canonical Huffman decoder.
pub struct HuffmanDecoder {
    ari: Box<[u8]>,
    cnt: [u8; 256],
}

impl HuffmanDecoder {
    /// Parse a serialized table; returns the decoder and bytes consumed.
    pub fn from_table(table: &[u8]) -> Result<(Self, usize)> {
        let mut ari = vec![0u8; TABLE_SIZE].into_boxed_slice();
        let mut cnt = [255u8; 256];
        let mut cur = Cur { d: table, i: 0 };
        match cur.u8()? {
            0 => {}
            1 => read_dtable(&mut cur, &mut ari, &mut cnt)?,
            v => {
                return Err(Error::corrupted(0, format!("bad huffman table version {v}")));
            }
        }
        Ok((Self { ari, cnt }, cur.i))
    }

    /// Decode a self-framing byte string, appending to `out`.
    pub fn decode(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.bitwise_decode(bytes_to_bits(data)?, out)
    }

    /// Decode a raw bit span, appending to `out`.
    pub fn bitwise_decode(&self, data: EntropyBits<'_>, out: &mut Vec<u8>) -> Result<()> {
        let mut reader = BitReader::new(data);
        if reader.remaining() == 0 {
            return Ok(());
        }
        let mut st = HufState::default();
        let first = (reader.remaining() - 1) % HEADER_BLOCK_BITS + 1;
        reader.read(first, &mut st.bits, &mut st.bit_count);
        loop {
            if st.bit_count < BLOCK_BITS {
                if reader.remaining() > 0 {
                    reader.read(HEADER_BLOCK_BITS, &mut st.bits, &mut st.bit_count);
                } else if st.bit_count == 0 {
                    break;
                }
            }
            let c = self.ari[(st.bits >> (64 - BLOCK_BITS)) as usize];
            let b = self.cnt[c as usize] as usize;
            if b > st.bit_count {
                return Err(Error::corrupted(0, "huffman code past end of stream"));
            }
            out.push(c);
            st.bits <<= b;
            st.bit_count -= b;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Order-1 codec

/// Order-1 canonical Huffman encoder: 257 contexts keyed by the previous
/// byte, context 256 for a record's first symbol.
pub struct HuffmanEncoderO1 {
    syms: Box<[[EncSym; 256]]>,
    table: Vec<u8>,
}

impl HuffmanEncoderO1 {
    /// Build per-context codes from a finished order-1 histogram.
    pub fn new(hist: &HistogramO1) -> Self {
        Self::with_table_compression(hist, true)
    }

    /// As [`Self::new`], but `compress: false` keeps the serialized table
    /// raw for faster open at the cost of a larger file.
    pub fn with_table_compression(hist: &HistogramO1, compress: bool) -> Self {
        let mut syms = vec![[EncSym::default(); 256]; 257].into_boxed_slice();
        let mut table = Vec::with_capacity(258 * 257 * 3);
        if hist.o0_size == 0 {
            table.push(0);
            return Self { syms, table };
        }
        table.push(1);
        if hist.o1_size.iter().all(|&v| v == 0) {
            table.push(0);
        } else {
            table.push(1);
            let mut rle = 0usize;
            for i in 0..256usize {
                if hist.o1_size[i] == 0 {
                    continue;
                }
                if rle > 0 {
                    rle -= 1;
                } else {
                    table.push(i as u8);
                    if i > 0 && hist.o1_size[i - 1] != 0 {
                        let mut k = i + 1;
                        while k < 256 && hist.o1_size[k] != 0 {
                            k += 1;
                        }
                        rle = k - i - 1;
                        table.push(rle as u8);
                    }
                }
                build_ctable(&hist.o1[i], &mut syms[i], Some(&mut table));
            }
            table.push(0);
        }
        build_ctable(&hist.o0, &mut syms[CTX0], Some(&mut table));

        // The table itself is usually compressible: nest an order-0 pass
        // and keep it when strictly smaller. Lead byte 255 flags nesting.
        if compress {
            let mut fh = FreqHist::all();
            fh.add_record(&table);
            fh.finish();
            if fh.histogram().o0_size >= NORMALISE as u64 {
                fh.normalise(NORMALISE);
            }
            let inner = HuffmanEncoder::new(fh.histogram());
            let packed = inner.encode(&table);
            if packed.len() + inner.table().len() + 1 < table.len() {
                let mut nested = Vec::with_capacity(packed.len() + inner.table().len() + 1);
                nested.push(255);
                nested.extend_from_slice(inner.table());
                nested.extend_from_slice(&packed);
                table = nested;
            }
        }
        Self { syms, table }
    }

    /// The serialized table understood by [`HuffmanDecoderO1::from_table`].
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    #[inline]
    fn sym(&self, record: &[u8], i: usize) -> EncSym {
        let ctx = if i == 0 { CTX0 } else { record[i - 1] as usize };
        self.syms[ctx][record[i] as usize]
    }

    /// Encode with a single state (byte framing).
    pub fn encode_x1(&self, record: &[u8]) -> Vec<u8> {
        self.bitwise_encode_x1(record).into_bytes()
    }

    /// Encode 2-way interleaved (byte framing).
    pub fn encode_x2(&self, record: &[u8]) -> Vec<u8> {
        self.bitwise_encode_xn::<2>(record).into_bytes()
    }

    /// Encode 4-way interleaved (byte framing).
    pub fn encode_x4(&self, record: &[u8]) -> Vec<u8> {
        self.bitwise_encode_xn::<4>(record).into_bytes()
    }

    /// Encode 8-way interleaved (byte framing).
    pub fn encode_x8(&self, record: &[u8]) -> Vec<u8> {
        self.bitwise_encode_xn::<8>(record).into_bytes()
    }

    /// Encode with the given interleave (1, 2, 4 or 8).
    pub fn encode_interleaved(&self, record: &[u8], n: usize) -> Vec<u8> {
        match n {
            1 => self.encode_x1(record),
            2 => self.encode_x2(record),
            4 => self.encode_x4(record),
            8 => self.encode_x8(record),
            _ => panic!("unsupported interleave {n}"),
        }
    }

    /// Encode with a single state into a raw bit span.
    pub fn bitwise_encode_x1(&self, record: &[u8]) -> EntropyBitsOwned {
        encode_x1_loop(record, |i| self.sym(record, i))
    }

    /// Interleaved encode: positions `p ≡ k (mod N)` feed lane `k`. The
    /// stream opens with the record length, then carries 52-bit refill
    /// chunks in exactly the order the decoder's "refill a lane when it
    /// drops below 12 bits" rule consumes them; each lane's chunk sequence
    /// is its own code stream cut every 52 bits and zero-padded at the tail.
    pub fn bitwise_encode_xn<const N: usize>(&self, record: &[u8]) -> EntropyBitsOwned {
        assert!(record.len() < u32::MAX as usize);
        let mut lanes: [MsbBits; N] = core::array::from_fn(|_| MsbBits::default());
        let mut lens = Vec::with_capacity(record.len());
        for p in 0..record.len() {
            let s = self.sym(record, p);
            lanes[p % N].push(u64::from(s.bits), s.bit_count as usize);
            lens.push(s.bit_count as u8);
        }
        // Replay the decoder's refill schedule to learn the chunk order.
        let mut events = Vec::with_capacity(lanes.iter().map(|l| l.len).sum::<usize>() / 40 + N);
        let mut cnt = [0usize; N];
        for (p, &b) in lens.iter().enumerate() {
            let k = p % N;
            if cnt[k] < BLOCK_BITS {
                events.push(k as u8);
                cnt[k] += HEADER_BLOCK_BITS;
            }
            cnt[k] -= b as usize;
        }
        let mut w = ReverseBitWriter::with_capacity(record.len() * 5 / 4 + 8 * N);
        let mut next = [0usize; N];
        for &k in &events {
            next[k as usize] += 1;
        }
        for &k in events.iter().rev() {
            let k = k as usize;
            next[k] -= 1;
            w.write(lanes[k].get(next[k] * HEADER_BLOCK_BITS), HEADER_BLOCK_BITS);
        }
        w.write((record.len() as u64) << 32, 32);
        w.finish()
    }
}

/// MSB-first bit accumulator used to stage per-lane code streams.
#[derive(Default)]
struct MsbBits {
    words: Vec<u64>,
    len: usize,
}

impl MsbBits {
    fn push(&mut self, code: u64, b: usize) {
        debug_assert!(b > 0 && b <= BLOCK_BITS);
        let off = self.len % 64;
        if off == 0 {
            self.words.push(0);
        }
        let shifted = code << (64 - b);
        let last = self.words.len() - 1;
        self.words[last] |= shifted >> off;
        if off + b > 64 {
            self.words.push(shifted << (64 - off));
        }
        self.len += b;
    }

    /// 52 bits at `pos`, MSB-aligned, zero past the end.
    fn get(&self, pos: usize) -> u64 {
        let w = pos / 64;
        let off = pos % 64;
        let a = self.words.get(w).copied().unwrap_or(0) << off;
        let b = if off == 0 {
            0
        } else {
            self.words.get(w + 1).copied().unwrap_or(0) >> (64 - off)
        };
        (a | b) & !(u64::MAX >> HEADER_BLOCK_BITS)
    }
}

/// Order-1 canonical Huffman decoder.
pub struct HuffmanDecoderO1 {
    /// 257 windows of 4096 symbols, flat.
    ari: Box<[u8]>,
    cnt: Box<[[u8; 256]]>,
}

impl HuffmanDecoderO1 {
    /// Parse a serialized order-1 table; returns the decoder and bytes
    /// consumed. A nested (255-flagged) table consumes the whole slice.
    pub fn from_table(table: &[u8]) -> Result<(Self, usize)> {
        let mut ari = vec![0u8; 257 * TABLE_SIZE].into_boxed_slice();
        let mut cnt = vec![[255u8; 256]; 257].into_boxed_slice();
        let first = *table
            .first()
            .ok_or_else(|| Error::corrupted(0, "empty huffman table"))?;
        let unpacked;
        let (body, consumed): (&[u8], usize) = if first == 255 {
            let (inner, read) = HuffmanDecoder::from_table(&table[1..])?;
            let mut buf = Vec::new();
            inner.decode(&table[1 + read..], &mut buf)?;
            unpacked = buf;
            (&unpacked, table.len())
        } else {
            (table, 0)
        };
        let mut cur = Cur { d: body, i: 0 };
        match cur.u8()? {
            0 => {
                let used = if first == 255 { consumed } else { cur.i };
                return Ok((Self { ari, cnt }, used));
            }
            1 => {}
            v => {
                return Err(Error::corrupted(0, format!("bad huffman table version {v}")));
            }
        }
        if cur.u8()? != 0 {
            let mut rle = 0usize;
            let mut i = cur.u8()? as usize;
            loop {
                if i > 255 {
                    return Err(Error::corrupted(cur.i as u64, "bad context index"));
                }
                read_dtable(
                    &mut cur,
                    &mut ari[i * TABLE_SIZE..(i + 1) * TABLE_SIZE],
                    &mut cnt[i],
                )?;
                if rle == 0 && i + 1 == cur.peek()? as usize {
                    i = cur.u8()? as usize;
                    rle = cur.u8()? as usize;
                } else if rle > 0 {
                    rle -= 1;
                    i += 1;
                } else {
                    i = cur.u8()? as usize;
                }
                if i == 0 {
                    break;
                }
            }
        }
        read_dtable(
            &mut cur,
            &mut ari[CTX0 * TABLE_SIZE..(CTX0 + 1) * TABLE_SIZE],
            &mut cnt[CTX0],
        )?;
        let used = if first == 255 { consumed } else { cur.i };
        Ok((Self { ari, cnt }, used))
    }

    #[inline]
    fn lookup(&self, ctx: usize, window: usize) -> (u8, usize) {
        let c = self.ari[ctx * TABLE_SIZE + window];
        (c, self.cnt[ctx][c as usize] as usize)
    }

    /// Decode a single-state stream (byte framing).
    pub fn decode_x1(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.bitwise_decode_x1(bytes_to_bits(data)?, out)
    }

    /// Decode a 2-way stream (byte framing).
    pub fn decode_x2(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.bitwise_decode_xn::<2>(bytes_to_bits(data)?, out)
    }

    /// Decode a 4-way stream (byte framing).
    pub fn decode_x4(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.bitwise_decode_xn::<4>(bytes_to_bits(data)?, out)
    }

    /// Decode an 8-way stream (byte framing).
    pub fn decode_x8(&self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.bitwise_decode_xn::<8>(bytes_to_bits(data)?, out)
    }

    /// Decode with the given interleave (1, 2, 4 or 8).
    pub fn decode_interleaved(&self, data: &[u8], n: usize, out: &mut Vec<u8>) -> Result<()> {
        match n {
            1 => self.decode_x1(data, out),
            2 => self.decode_x2(data, out),
            4 => self.decode_x4(data, out),
            8 => self.decode_x8(data, out),
            _ => Err(Error::invalid_argument(format!("interleave {n}"))),
        }
    }

    /// Decode a single-state raw bit span.
    pub fn bitwise_decode_x1(&self, data: EntropyBits<'_>, out: &mut Vec<u8>) -> Result<()> {
        let mut reader = BitReader::new(data);
        if reader.remaining() == 0 {
            return Ok(());
        }
        let mut st = HufState::default();
        let mut ctx = CTX0;
        let first = (reader.remaining() - 1) % HEADER_BLOCK_BITS + 1;
        reader.read(first, &mut st.bits, &mut st.bit_count);
        loop {
            if st.bit_count < BLOCK_BITS {
                if reader.remaining() > 0 {
                    reader.read(HEADER_BLOCK_BITS, &mut st.bits, &mut st.bit_count);
                } else if st.bit_count == 0 {
                    break;
                }
            }
            let (c, b) = self.lookup(ctx, (st.bits >> (64 - BLOCK_BITS)) as usize);
            if b > st.bit_count {
                return Err(Error::corrupted(0, "huffman code past end of stream"));
            }
            out.push(c);
            ctx = c as usize;
            st.bits <<= b;
            st.bit_count -= b;
        }
        Ok(())
    }

    /// Decode an interleaved raw bit span: N lane states refill 52 bits
    /// from the shared reader whenever they drop below the 12-bit window.
    pub fn bitwise_decode_xn<const N: usize>(
        &self,
        data: EntropyBits<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let mut reader = BitReader::new(data);
        if reader.remaining() < 32 {
            return Err(Error::corrupted(0, "interleaved stream lacks length"));
        }
        let len = reader.read_bits(32) as usize;
        if len > reader.remaining() {
            return Err(Error::corrupted(0, "interleaved stream length too large"));
        }
        let mut bits = [0u64; N];
        let mut cnts = [0usize; N];
        let mut ctx = CTX0;
        out.reserve(len);
        for p in 0..len {
            let k = p % N;
            if cnts[k] < BLOCK_BITS {
                if reader.remaining() < HEADER_BLOCK_BITS {
                    return Err(Error::corrupted(0, "interleaved stream truncated"));
                }
                let mut chunk = 0u64;
                let mut sh = 0usize;
                reader.read(HEADER_BLOCK_BITS, &mut chunk, &mut sh);
                bits[k] |= chunk >> cnts[k];
                cnts[k] += HEADER_BLOCK_BITS;
            }
            let (c, b) = self.lookup(ctx, (bits[k] >> (64 - BLOCK_BITS)) as usize);
            if b > cnts[k] {
                return Err(Error::corrupted(0, "huffman code past end of stream"));
            }
            out.push(c);
            ctx = c as usize;
            bits[k] <<= b;
            cnts[k] -= b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxizbs_core::hist::{FreqHist, FreqHistO1};

    fn sample_corpus() -> Vec<Vec<u8>> {
        let mut v = vec![
            b"".to_vec(),
            b"a".to_vec(),
            b"aaaab".to_vec(),
            b"hello world, hello huffman".to_vec(),
            (0..=255u8).collect::<Vec<u8>>(),
            b"the quick brown fox jumps over the lazy dog".repeat(7),
            vec![42u8; 500],
        ];
        // A pseudo random record with a skewed distribution.
        let mut x = 0x12345678u32;
        let mut r = Vec::new();
        for _ in 0..4096 {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            r.push((x >> 24) as u8 & 0x3F);
        }
        v.push(r);
        v
    }

    fn o0_pair(records: &[Vec<u8>]) -> (HuffmanEncoder, HuffmanDecoder) {
        let mut fh = FreqHist::all();
        for r in records {
            fh.add_record(r);
        }
        fh.finish();
        if fh.histogram().o0_size >= NORMALISE as u64 {
            fh.normalise(NORMALISE);
        }
        let e = HuffmanEncoder::new(fh.histogram());
        let (d, used) = HuffmanDecoder::from_table(e.table()).unwrap();
        assert_eq!(used, e.table().len());
        (e, d)
    }

    fn o1_pair(records: &[Vec<u8>]) -> (HuffmanEncoderO1, HuffmanDecoderO1) {
        let mut fh = FreqHistO1::all();
        for r in records {
            fh.add_record(r);
        }
        fh.finish();
        let e = HuffmanEncoderO1::new(fh.histogram());
        let (d, used) = HuffmanDecoderO1::from_table(e.table()).unwrap();
        assert_eq!(used, e.table().len());
        (e, d)
    }

    #[test]
    fn test_o0_roundtrip() {
        let recs = sample_corpus();
        let (e, d) = o0_pair(&recs);
        for r in &recs {
            let z = e.encode(r);
            let mut out = Vec::new();
            d.decode(&z, &mut out).unwrap();
            assert_eq!(&out, r);
        }
    }

    #[test]
    fn test_o0_tiny_alphabet_compresses() {
        let recs = vec![b"aaaab".to_vec()];
        let (e, d) = o0_pair(&recs);
        let z = e.encode(b"aaaab");
        assert!(z.len() < 5, "got {} bytes", z.len());
        let mut out = Vec::new();
        d.decode(&z, &mut out).unwrap();
        assert_eq!(out, b"aaaab");
    }

    #[test]
    fn test_o0_single_symbol_alphabet() {
        let recs = vec![vec![9u8; 100]];
        let (e, d) = o0_pair(&recs);
        let z = e.encode(&recs[0]);
        let mut out = Vec::new();
        d.decode(&z, &mut out).unwrap();
        assert_eq!(out, recs[0]);
    }

    #[test]
    fn test_o1_roundtrip_all_interleaves() {
        let recs = sample_corpus();
        let (e, d) = o1_pair(&recs);
        for r in &recs {
            for n in [1usize, 2, 4, 8] {
                let z = e.encode_interleaved(r, n);
                let mut out = Vec::new();
                d.decode_interleaved(&z, n, &mut out).unwrap();
                assert_eq!(&out, r, "interleave {n}, len {}", r.len());
            }
        }
    }

    #[test]
    fn test_o1_interleave_boundary_lengths() {
        // Lengths around lane-count multiples exercise ragged final rounds.
        let recs = sample_corpus();
        let (e, d) = o1_pair(&recs);
        let big = &recs[5];
        for n in [2usize, 4, 8] {
            for take in [0usize, 1, 2, 3, 7, 8, 9, 15, 16, 17, 63, 64, 65, 300] {
                let r = &big[..take.min(big.len())];
                let z = e.encode_interleaved(r, n);
                let mut out = Vec::new();
                d.decode_interleaved(&z, n, &mut out).unwrap();
                assert_eq!(out, r, "interleave {n} take {take}");
            }
        }
    }

    #[test]
    fn test_o1_table_nesting() {
        // A rich corpus produces a table big enough for the nested pass
        // to win; the decoder must still parse it.
        let mut recs = Vec::new();
        let mut x = 7u32;
        for _ in 0..64 {
            let mut r = Vec::new();
            for _ in 0..512 {
                x = x.wrapping_mul(48271) % 0x7FFFFFFF;
                r.push((x & 0xFF) as u8);
            }
            recs.push(r);
        }
        let (e, d) = o1_pair(&recs);
        assert_eq!(e.table()[0], 255, "expected nested table");
        let z = e.encode_x4(&recs[0]);
        let mut out = Vec::new();
        d.decode_x4(&z, &mut out).unwrap();
        assert_eq!(out, recs[0]);
    }

    #[test]
    fn test_corrupt_stream_rejected() {
        let recs = sample_corpus();
        let (e, d) = o0_pair(&recs);
        let z = e.encode(&recs[5]);
        // Truncating the stream must surface as corruption, not panic.
        let mut out = Vec::new();
        let r = d.decode(&z[..z.len() / 2], &mut out);
        // Either an error or a short (wrong) output is acceptable for a
        // truncated order-0 stream; it must never panic. The interleaved
        // decoder detects truncation explicitly.
        let _ = r;
        let (e1, d1) = o1_pair(&recs);
        let z1 = e1.encode_x4(&recs[5]);
        let mut out1 = Vec::new();
        assert!(d1.decode_x4(&z1[..4], &mut out1).is_err());
    }

    #[test]
    fn test_empty_histogram_table() {
        let fh = {
            let mut f = FreqHist::all();
            f.finish();
            f
        };
        let e = HuffmanEncoder::new(fh.histogram());
        assert_eq!(e.table(), &[0]);
        let (d, used) = HuffmanDecoder::from_table(e.table()).unwrap();
        assert_eq!(used, 1);
        let z = e.encode(b"");
        let mut out = Vec::new();
        d.decode(&z, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
