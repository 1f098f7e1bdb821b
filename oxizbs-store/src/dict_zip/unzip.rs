//! Token-stream inflate: the dictionary-zip decoder hot loop.
//!
//! Two variants share the same semantics: the plain loop resolves every
//! token as it arrives; the delayed-global loop defers each dictionary
//! copy by one token so the dictionary cache line can travel while local
//! work proceeds. Both append to `out` and fail with `Corruption` on any
//! malformed token.

use super::token::{DzType, G_MIN_LEN, GlobalLayout, read_varint};
use oxizbs_core::error::{Error, Result};

#[inline]
fn bad(msg: &'static str) -> Error {
    Error::corrupted_at_unknown(msg)
}

#[inline]
fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let s = data
        .get(*pos..*pos + n)
        .ok_or_else(|| bad("token past end of stream"))?;
    *pos += n;
    Ok(s)
}

/// Copy `len` bytes from `distance` back, byte-serial when the ranges
/// overlap.
#[inline]
fn copy_back(out: &mut Vec<u8>, distance: usize, len: usize) -> Result<()> {
    if distance == 0 || distance > out.len() {
        return Err(bad("back-reference before start of record"));
    }
    let start = out.len() - distance;
    if distance >= len {
        out.extend_from_within(start..start + len);
    } else {
        for i in 0..len {
            let b = out[start + i];
            out.push(b);
        }
    }
    Ok(())
}

/// Decode one token head shared by both variants. Returns the action.
enum Tok {
    Literal { len: usize },
    Global { offset: usize, len: usize },
    Back { distance: usize, len: usize },
    Rle { len: usize },
}

#[inline]
fn next_token(data: &[u8], pos: &mut usize, g: &GlobalLayout) -> Result<Tok> {
    let b = data[*pos] as usize;
    *pos += 1;
    let tag = b & 7;
    Ok(match tag {
        t if t == DzType::Literal as usize => Tok::Literal { len: (b >> 3) + 1 },
        t if t == DzType::Global as usize => {
            let raw = take(data, pos, g.offset_bytes)?;
            let mut v = 0usize;
            for (i, &byte) in raw.iter().enumerate() {
                v |= (byte as usize) << (8 * i);
            }
            let len_mask = (1usize << g.len_bits_in_offset) - 1;
            let mut len = ((v & len_mask) << 5) | (b >> 3);
            let offset = v >> g.len_bits_in_offset;
            if len < g.short_len_mask {
                len += G_MIN_LEN;
            } else {
                let extra = read_varint(data, pos).ok_or_else(|| bad("global length varint"))?;
                len = extra + G_MIN_LEN + g.short_len_mask;
            }
            Tok::Global { offset, len }
        }
        t if t == DzType::Rle as usize => Tok::Rle { len: (b >> 3) + 2 },
        t if t == DzType::NearShort as usize => Tok::Back {
            distance: (b >> 5) + 2,
            len: ((b >> 3) & 3) + 2,
        },
        t if t == DzType::Far1Short as usize => Tok::Back {
            distance: 2 + take(data, pos, 1)?[0] as usize,
            len: (b >> 3) + 2,
        },
        t if t == DzType::Far2Short as usize => {
            let d = take(data, pos, 2)?;
            Tok::Back {
                distance: 258 + u16::from_le_bytes([d[0], d[1]]) as usize,
                len: (b >> 3) + 2,
            }
        }
        t if t == DzType::Far2Long as usize => {
            let mut len = b >> 3;
            if len < 31 {
                len += 34;
            } else {
                len = read_varint(data, pos).ok_or_else(|| bad("far2long length varint"))? + 65;
            }
            let d = take(data, pos, 2)?;
            Tok::Back {
                distance: u16::from_le_bytes([d[0], d[1]]) as usize,
                len,
            }
        }
        _ => {
            let mut len = b >> 3;
            if len < 31 {
                len += 5;
            } else {
                len = read_varint(data, pos).ok_or_else(|| bad("far3long length varint"))? + 36;
            }
            let d = take(data, pos, 3)?;
            Tok::Back {
                distance: d[0] as usize | (d[1] as usize) << 8 | (d[2] as usize) << 16,
                len,
            }
        }
    })
}

/// Plain inflate: resolve each token as it is read.
pub fn unzip(
    data: &[u8],
    out: &mut Vec<u8>,
    dict: &[u8],
    g: &GlobalLayout,
    reserve_multiplier: usize,
) -> Result<()> {
    out.reserve(data.len() * reserve_multiplier.max(1));
    let mut pos = 0usize;
    while pos < data.len() {
        match next_token(data, &mut pos, g)? {
            Tok::Literal { len } => {
                let s = take(data, &mut pos, len)?;
                out.extend_from_slice(s);
            }
            Tok::Global { offset, len } => {
                let s = dict
                    .get(offset..offset + len)
                    .ok_or_else(|| bad("global match outside dictionary"))?;
                out.extend_from_slice(s);
            }
            Tok::Rle { len } => {
                let last = *out.last().ok_or_else(|| bad("run before first byte"))?;
                out.resize(out.len() + len, last);
            }
            Tok::Back { distance, len } => copy_back(out, distance, len)?,
        }
    }
    Ok(())
}

/// Delayed-global inflate: each dictionary copy is parked until the next
/// token (or end of record) and lands just before anything that could read
/// its bytes.
pub fn unzip_delayed(
    data: &[u8],
    out: &mut Vec<u8>,
    dict: &[u8],
    g: &GlobalLayout,
    reserve_multiplier: usize,
) -> Result<()> {
    out.reserve(data.len() * reserve_multiplier.max(1));
    let mut pos = 0usize;
    let mut pending: Option<(usize, usize, usize)> = None; // (at, offset, len)
    let mut flush = |out: &mut Vec<u8>, pending: &mut Option<(usize, usize, usize)>| -> Result<()> {
        if let Some((at, offset, len)) = pending.take() {
            let s = dict
                .get(offset..offset + len)
                .ok_or_else(|| bad("global match outside dictionary"))?;
            out[at..at + len].copy_from_slice(s);
        }
        Ok(())
    };
    while pos < data.len() {
        match next_token(data, &mut pos, g)? {
            Tok::Literal { len } => {
                let s = take(data, &mut pos, len)?;
                out.extend_from_slice(s);
                flush(out, &mut pending)?;
            }
            Tok::Global { offset, len } => {
                flush(out, &mut pending)?;
                if offset + len > dict.len() {
                    return Err(bad("global match outside dictionary"));
                }
                let at = out.len();
                out.resize(at + len, 0);
                pending = Some((at, offset, len));
            }
            Tok::Rle { len } => {
                flush(out, &mut pending)?;
                let last = *out.last().ok_or_else(|| bad("run before first byte"))?;
                out.resize(out.len() + len, last);
            }
            Tok::Back { distance, len } => {
                flush(out, &mut pending)?;
                copy_back(out, distance, len)?;
            }
        }
    }
    flush(out, &mut pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict_zip::zip::zip_record;
    use crate::dict_zip::sa_cache::SuffixDictCache;

    fn check_both(data: &[u8], dict: &[u8], expect: &[u8]) {
        let g = GlobalLayout::new(dict.len().max(G_MIN_LEN + 1));
        for delayed in [false, true] {
            let mut out = Vec::new();
            let r = if delayed {
                unzip_delayed(data, &mut out, dict, &g, 2)
            } else {
                unzip(data, &mut out, dict, &g, 2)
            };
            r.unwrap();
            assert_eq!(out, expect, "delayed={delayed}");
        }
    }

    #[test]
    fn test_literal_and_rle() {
        // Literal "a" then a run of 4 decodes as "aaaaa".
        let data = [
            (DzType::Literal as u8) | (0 << 3),
            b'a',
            (DzType::Rle as u8) | (2 << 3),
        ];
        check_both(&data, b"0123456789", b"aaaaa");
    }

    #[test]
    fn test_roundtrip_through_compressor() {
        let dict = b"abcdefghij_the_common_prefix_material_0123456789".to_vec();
        let cache = SuffixDictCache::build(dict.clone(), 2, 64);
        let records: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"abcdef".to_vec(),
            b"aaaaa".to_vec(),
            b"xyzxyzxyzxyzxyz".to_vec(),
            b"the_common_prefix_material_the_common_prefix_material".to_vec(),
            (0..200u8).collect(),
            vec![7u8; 300],
        ];
        let g = GlobalLayout::new(dict.len());
        let mut scratch = crate::dict_zip::zip::LocalMatcher::default();
        for r in &records {
            let mut z = Vec::new();
            zip_record(r, &cache, &g, 8, false, &mut scratch, &mut z).unwrap();
            check_both(&z, &dict, r);
        }
    }

    #[test]
    fn test_corrupt_rejected() {
        let dict = b"0123456789".to_vec();
        let g = GlobalLayout::new(dict.len());
        // Back-reference with nothing decoded yet.
        let data = [(DzType::Rle as u8) | (2 << 3)];
        let mut out = Vec::new();
        assert!(unzip(&data, &mut out, &dict, &g, 2).is_err());
        // Literal running past the end.
        let data = [(DzType::Literal as u8) | (31 << 3), 1, 2];
        let mut out = Vec::new();
        assert!(unzip(&data, &mut out, &dict, &g, 2).is_err());
    }
}
