//! Dictionary-zip store: LZ-style compression against a shared global
//! dictionary, with local back-references and an optional order-1 Huffman
//! second pass.
//!
//! Build: feed samples, build the dictionary (suffix array + interval
//! cache), stream records through the token encoder (inline or pipelined),
//! optionally entropy-code each token stream, finalize offsets and footer.
//! Read: offset lookup, optional per-record checksum, optional entropy
//! decode, token inflate against the dictionary.

mod builder;
mod sa_cache;
mod store;
mod suffix_array;
mod token;
mod unzip;
mod zip;

pub use builder::{
    CLASS_NAME, DictZipBuilder, DictZipOptions, EntropyAlgo, MAX_DICT_BYTES, SampleSort, ZipStat,
};
pub use sa_cache::{MatchStatus, SuffixDictCache};
pub use store::{DictZipStore, load_boxed};
pub use suffix_array::suffix_array;
pub use token::{DzType, G_MIN_LEN, GlobalLayout};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BlobStore, CacheOffsets};
    use oxizbs_core::mem::StoreMem;

    fn sample_corpus() -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut samples = Vec::new();
        let mut records = Vec::new();
        for i in 0..40usize {
            samples.push(
                format!("user-profile-{i:03} city=metropolis role=operator flags=aa,bb,cc ")
                    .into_bytes(),
            );
        }
        for i in 0..300usize {
            records.push(
                format!(
                    "user-profile-{:03} city=metropolis role=operator flags=aa,bb,cc extra={}",
                    i % 50,
                    "padding ".repeat(i % 7)
                )
                .into_bytes(),
            );
        }
        records.push(Vec::new());
        records.push(b"completely unrelated bytes \x00\x01\x02".to_vec());
        records.push(vec![9u8; 2000]);
        (samples, records)
    }

    fn build_store(opts: DictZipOptions) -> (Vec<Vec<u8>>, DictZipStore) {
        let (samples, records) = sample_corpus();
        let mut b = DictZipBuilder::new(opts.clone()).unwrap();
        for s in &samples {
            b.add_sample(s).unwrap();
        }
        b.prepare(records.len()).unwrap();
        for r in &records {
            b.add_record(r).unwrap();
        }
        let (file, dict) = b.finish().unwrap();
        let store = if opts.embed_dict {
            assert!(dict.is_none());
            DictZipStore::load(StoreMem::from_vec(file)).unwrap()
        } else {
            DictZipStore::load_with_dict(StoreMem::from_vec(file), dict.unwrap()).unwrap()
        };
        (records, store)
    }

    #[test]
    fn test_roundtrip_single_thread() {
        let (records, store) = build_store(DictZipOptions {
            threads: Some(0),
            ..Default::default()
        });
        assert_eq!(store.num_records(), records.len());
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r, "record {i}");
        }
    }

    #[test]
    fn test_roundtrip_pipeline() {
        let (records, store) = build_store(DictZipOptions {
            threads: Some(3),
            checksum_level: 2,
            ..Default::default()
        });
        for (i, r) in records.iter().enumerate() {
            assert_eq!(&store.get_record(i).unwrap(), r, "record {i}");
        }
    }

    #[test]
    fn test_roundtrip_entropy_and_sorted_offsets() {
        for ilv in [1usize, 4] {
            let (records, store) = build_store(DictZipOptions {
                threads: Some(0),
                entropy_algo: EntropyAlgo::HuffmanO1,
                entropy_interleave: Some(ilv),
                offset_block_units: 7,
                checksum_level: 2,
                ..Default::default()
            });
            let mut co = CacheOffsets::default();
            for (i, r) in records.iter().enumerate() {
                store.get_record_cached(i, &mut co).unwrap();
                assert_eq!(&co.rec_data, r, "interleave {ilv} record {i}");
            }
        }
    }

    #[test]
    fn test_external_dictionary() {
        let (records, store) = build_store(DictZipOptions {
            threads: Some(0),
            embed_dict: false,
            ..Default::default()
        });
        for (i, r) in records.iter().enumerate().step_by(17) {
            assert_eq!(&store.get_record(i).unwrap(), r);
        }
    }

    #[test]
    fn test_sample_sort_modes() {
        for sort in [SampleSort::None, SampleSort::Left, SampleSort::Right, SampleSort::Both] {
            let (records, store) = build_store(DictZipOptions {
                threads: Some(0),
                sample_sort: sort,
                ..Default::default()
            });
            for (i, r) in records.iter().enumerate().step_by(23) {
                assert_eq!(&store.get_record(i).unwrap(), r, "{sort:?}");
            }
        }
    }

    #[test]
    fn test_compression_wins_on_redundant_corpus() {
        let (records, store) = build_store(DictZipOptions {
            threads: Some(0),
            entropy_algo: EntropyAlgo::HuffmanO1,
            ..Default::default()
        });
        let raw: usize = records.iter().map(|r| r.len()).sum();
        assert!(
            store.mem_size() < raw,
            "compressed {} vs raw {raw}",
            store.mem_size()
        );
    }

    #[test]
    fn test_empty_store() {
        let mut b = DictZipBuilder::new(DictZipOptions {
            threads: Some(0),
            ..Default::default()
        })
        .unwrap();
        b.prepare(0).unwrap();
        let (file, _) = b.finish().unwrap();
        let store = DictZipStore::load(StoreMem::from_vec(file)).unwrap();
        assert_eq!(store.num_records(), 0);
        assert!(store.get_record(0).is_err());
    }

    #[test]
    fn test_reorder_and_purge() {
        let (records, store) = build_store(DictZipOptions {
            threads: Some(0),
            entropy_algo: EntropyAlgo::HuffmanO1,
            checksum_level: 2,
            offset_block_units: 6,
            ..Default::default()
        });
        let n = records.len();
        let perm: Vec<usize> = (0..n).rev().collect();
        let mut out = Vec::new();
        store
            .reorder_zip_data(&mut perm.iter().copied(), &mut |b| out.extend_from_slice(b))
            .unwrap();
        let r2 = DictZipStore::load(StoreMem::from_vec(out)).unwrap();
        for (new_id, &old_id) in perm.iter().enumerate().step_by(13) {
            assert_eq!(r2.get_record(new_id).unwrap(), records[old_id]);
        }

        let mut out = Vec::new();
        store
            .purge_zip_data(&|i| i % 3 == 0, &mut |b| out.extend_from_slice(b))
            .unwrap();
        let p = DictZipStore::load(StoreMem::from_vec(out)).unwrap();
        let survivors: Vec<usize> = (0..n).filter(|i| i % 3 != 0).collect();
        assert_eq!(p.num_records(), survivors.len());
        for (new_id, &old_id) in survivors.iter().enumerate().step_by(11) {
            assert_eq!(p.get_record(new_id).unwrap(), records[old_id]);
        }
    }
}
