//! Per-record token encoder: global dictionary matches, local
//! back-references, and literal runs, chosen by net byte savings.

use super::sa_cache::SuffixDictCache;
use super::suffix_array::suffix_array;
use super::token::{DzType, G_MIN_LEN, GlobalLayout, backref_meta, global_match_cost, write_varint};
use oxizbs_core::error::{Error, Result};

const NIL: u32 = u32::MAX;
/// Local back-references farther than this cannot be encoded.
const MAX_LOCAL_DISTANCE: usize = 1 << 24;

/// Reusable local-match scratch: a 4-byte-hash chain, or the record's own
/// suffix array when the suffix-array matcher is selected.
#[derive(Default)]
pub struct LocalMatcher {
    bucket: Vec<u32>,
    link: Vec<u32>,
}

#[inline]
fn hash_bytes(bytes: u32, shift: u32) -> u32 {
    bytes.wrapping_mul(0x1E35A7BD) >> shift
}

#[inline]
fn load4(rec: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([rec[at], rec[at + 1], rec[at + 2], rec[at + 3]])
}

/// Length of the common prefix of `rec[a..]` and `rec[b..]`, capped at
/// `limit`.
#[inline]
fn match_len(rec: &[u8], a: usize, b: usize, limit: usize) -> usize {
    let mut l = 0;
    while l < limit && rec[b + l] == rec[a + l] {
        l += 1;
    }
    l
}

struct BestLocal {
    pos: usize,
    len: usize,
    cost: i32,
}

/// Compress one record against the dictionary, appending tokens to `out`.
pub fn zip_record(
    rec: &[u8],
    dict: &SuffixDictCache,
    g: &GlobalLayout,
    max_probe: usize,
    use_sa_local: bool,
    scratch: &mut LocalMatcher,
    out: &mut Vec<u8>,
) -> Result<()> {
    if rec.len() >= u32::MAX as usize {
        return Err(Error::invalid_argument("record too large"));
    }
    let n = rec.len();
    let (bucket, link) = (&mut scratch.bucket, &mut scratch.link);
    let mut shift = 0u32;
    if use_sa_local {
        // Record-local suffix array and its inverse stand in for the hash
        // chain: neighbors in rank order are candidate matches.
        let sa = suffix_array(rec);
        bucket.clear();
        bucket.extend_from_slice(&sa);
        link.clear();
        link.resize(n, 0);
        for (rank, &pos) in sa.iter().enumerate() {
            link[pos as usize] = rank as u32;
        }
    } else {
        let bits = if n <= 1 {
            1
        } else {
            (64 - ((n - 1) as u64).leading_zeros()).min(24)
        };
        shift = 32 - bits;
        bucket.clear();
        bucket.resize(1usize << bits, NIL);
        link.clear();
        link.resize(n, NIL);
    }

    let mut literal_len = 0usize;
    let mut j = 0usize;
    while j < n {
        let mut best = BestLocal {
            pos: usize::MAX,
            len: 0,
            cost: 2,
        };
        if use_sa_local {
            if n >= 2 {
                let rank = link[j] as usize;
                let min_lo = rank.saturating_sub(max_probe);
                let mut lo = rank;
                while lo > min_lo {
                    lo -= 1;
                    let pos = bucket[lo] as usize;
                    if pos < j && j - pos < MAX_LOCAL_DISTANCE {
                        let len = match_len(rec, pos, j, n - j);
                        if len >= 2 {
                            let meta = backref_meta(j - pos, len);
                            if len as i32 - meta.cost > best.len as i32 - best.cost {
                                best = BestLocal {
                                    pos,
                                    len,
                                    cost: meta.cost,
                                };
                                break;
                            }
                        }
                    }
                }
                let max_hi = (rank + max_probe).min(n.saturating_sub(2));
                let mut hi = rank;
                while hi < max_hi {
                    hi += 1;
                    let pos = bucket[hi] as usize;
                    if pos < j && j - pos < MAX_LOCAL_DISTANCE {
                        let len = match_len(rec, pos, j, n - j);
                        if len >= 2 {
                            let meta = backref_meta(j - pos, len);
                            if len as i32 - meta.cost > best.len as i32 - best.cost {
                                best = BestLocal {
                                    pos,
                                    len,
                                    cost: meta.cost,
                                };
                                break;
                            }
                        }
                    }
                }
            }
        } else if j + 4 <= n {
            let h = hash_bytes(load4(rec, j), shift) as usize;
            let mut pos = bucket[h];
            let mut probe = 0usize;
            while probe < max_probe && pos != NIL && j - (pos as usize) < MAX_LOCAL_DISTANCE {
                let p = pos as usize;
                let len = match_len(rec, p, j, n - j);
                if len >= 2 {
                    let meta = backref_meta(j - p, len);
                    if len as i32 - meta.cost > best.len as i32 - best.cost {
                        best = BestLocal {
                            pos: p,
                            len,
                            cost: meta.cost,
                        };
                    }
                }
                probe += 1;
                pos = link[p];
            }
            link[j] = bucket[h];
            bucket[h] = j as u32;
        }

        let gm = dict.da_match_max_length(&rec[j..]);
        let local_gain = 0i32.max(best.len as i32 - best.cost);
        if gm.depth as i32 - global_match_cost(gm.depth, g.offset_bits, g.max_short_len)
            > local_gain
        {
            debug_assert!(gm.depth >= G_MIN_LEN);
            emit_literals(rec, j, &mut literal_len, out);
            let offset = dict.sa()[gm.lo] as usize;
            emit_global(offset, gm.depth, g, out);
            j += gm.depth;
        } else if best.len as i32 <= best.cost {
            literal_len += 1;
            j += 1;
        } else {
            emit_literals(rec, j, &mut literal_len, out);
            emit_backref(j - best.pos, best.len, out);
            j += best.len;
        }
    }
    emit_literals(rec, n, &mut literal_len, out);
    Ok(())
}

/// Flush the pending literal run ending just before `j`.
fn emit_literals(rec: &[u8], j: usize, literal_len: &mut usize, out: &mut Vec<u8>) {
    let mut len = *literal_len;
    while len >= 32 {
        out.push(DzType::Literal as u8 | (31 << 3));
        out.extend_from_slice(&rec[j - len..j - len + 32]);
        len -= 32;
    }
    if len > 0 {
        out.push(DzType::Literal as u8 | (((len - 1) as u8) << 3));
        out.extend_from_slice(&rec[j - len..j]);
    }
    *literal_len = 0;
}

fn emit_global(offset: usize, depth: usize, g: &GlobalLayout, out: &mut Vec<u8>) {
    let enc_len = depth - G_MIN_LEN;
    if depth <= g.max_short_len {
        out.push(DzType::Global as u8 | (((enc_len & 31) as u8) << 3));
        let v = (offset << g.len_bits_in_offset) | (enc_len >> 5);
        out.extend_from_slice(&v.to_le_bytes()[..g.offset_bytes]);
    } else {
        out.push(DzType::Global as u8 | (31 << 3));
        let ones = g.short_len_mask >> 5;
        let v = (offset << g.len_bits_in_offset) | ones;
        out.extend_from_slice(&v.to_le_bytes()[..g.offset_bytes]);
        write_varint(out, depth - g.max_short_len - 1);
    }
}

fn emit_backref(distance: usize, len: usize, out: &mut Vec<u8>) {
    let meta = backref_meta(distance, len);
    match meta.ty {
        DzType::Rle => {
            debug_assert!(distance == 1 && (2..=33).contains(&len));
            out.push(DzType::Rle as u8 | (((len - 2) as u8) << 3));
        }
        DzType::NearShort => {
            out.push(
                DzType::NearShort as u8
                    | (((len - 2) as u8) << 3)
                    | (((distance - 2) as u8) << 5),
            );
        }
        DzType::Far1Short => {
            out.push(DzType::Far1Short as u8 | (((len - 2) as u8) << 3));
            out.push((distance - 2) as u8);
        }
        DzType::Far2Short => {
            out.push(DzType::Far2Short as u8 | (((len - 2) as u8) << 3));
            out.extend_from_slice(&((distance - 258) as u16).to_le_bytes());
        }
        DzType::Far2Long => {
            if len <= 34 + 30 {
                out.push(DzType::Far2Long as u8 | (((len - 34) as u8) << 3));
            } else {
                out.push(DzType::Far2Long as u8 | (31 << 3));
                write_varint(out, len - 65);
            }
            out.extend_from_slice(&(distance as u16).to_le_bytes());
        }
        _ => {
            if len <= 35 {
                out.push(DzType::Far3Long as u8 | (((len - 5) as u8) << 3));
            } else {
                out.push(DzType::Far3Long as u8 | (31 << 3));
                write_varint(out, len - 36);
            }
            out.extend_from_slice(&(distance as u32).to_le_bytes()[..3]);
        }
    }
}
