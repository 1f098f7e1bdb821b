//! Environment-variable tuning knobs.
//!
//! All knobs are performance hints only; files written under any setting
//! load under any other. Malformed values are logged and ignored.

use std::env;

fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(x) => Some(x),
            Err(_) => {
                log::warn!("ignoring malformed {name}={v}");
                None
            }
        },
        Err(_) => None,
    }
}

/// Dictionary-zip pipeline width; 0 selects the single-thread builder.
pub fn zip_threads() -> Option<usize> {
    parse("OXIZBS_ZIP_THREADS")
}

/// Worker input batch size in bytes for the dictionary-zip pipeline.
pub fn batch_buffer_size() -> usize {
    parse("OXIZBS_BATCH_BUFFER_SIZE").unwrap_or(256 * 1024)
}

/// Default local-match probe limit.
pub fn max_probe(default: usize) -> usize {
    parse("OXIZBS_MAX_PROBE").unwrap_or(default)
}

/// Token-inflate variant: 0 auto, 1 plain, 2 delayed-global.
pub fn unzip_impl() -> usize {
    parse("OXIZBS_UNZIP_IMPL").unwrap_or(0)
}

/// Default Huffman interleave for entropy passes (1, 2, 4 or 8).
pub fn entropy_interleave() -> usize {
    let n: usize = parse("OXIZBS_ENTROPY_INTERLEAVE").unwrap_or(8);
    if matches!(n, 1 | 2 | 4 | 8) {
        n
    } else {
        log::warn!("OXIZBS_ENTROPY_INTERLEAVE={n} unsupported, using 8");
        8
    }
}
