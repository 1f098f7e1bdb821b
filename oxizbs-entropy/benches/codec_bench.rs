use criterion::{Criterion, criterion_group, criterion_main};
use oxizbs_core::hist::{FreqHist, FreqHistO1};
use oxizbs_entropy::huffman::{HuffmanDecoderO1, HuffmanEncoderO1, NORMALISE};
use oxizbs_entropy::rans;
use std::hint::black_box;

fn sample_text() -> Vec<u8> {
    let seed = b"It is a truth universally acknowledged, that a single man in \
                 possession of a good fortune, must be in want of a wife. ";
    seed.iter().copied().cycle().take(1 << 16).collect()
}

fn bench_huffman_o1(c: &mut Criterion) {
    let data = sample_text();
    let mut fh = FreqHistO1::all();
    fh.add_record(&data);
    fh.finish();
    if fh.histogram().o0_size >= NORMALISE as u64 {
        fh.normalise(NORMALISE);
    }
    let e = HuffmanEncoderO1::new(fh.histogram());
    let (d, _) = HuffmanDecoderO1::from_table(e.table()).unwrap();
    let z4 = e.encode_x4(&data);

    c.bench_function("huffman_o1_encode_x4_64k", |b| {
        b.iter(|| black_box(e.encode_x4(black_box(&data))))
    });
    c.bench_function("huffman_o1_decode_x4_64k", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            d.decode_x4(black_box(&z4), &mut out).unwrap();
            black_box(out)
        })
    });
}

fn bench_rans_o0(c: &mut Criterion) {
    let data = sample_text();
    let mut fh = FreqHist::all();
    fh.add_record(&data);
    fh.finish();
    fh.normalise(rans::TOTFREQ);
    let e = rans::RansEncoder::new(fh.histogram());
    let (d, _) = rans::RansDecoder::from_table(e.table()).unwrap();
    let z = e.encode_x8(&data).unwrap();

    c.bench_function("rans_o0_encode_x8_64k", |b| {
        b.iter(|| black_box(e.encode_x8(black_box(&data)).unwrap()))
    });
    c.bench_function("rans_o0_decode_x8_64k", |b| {
        b.iter(|| black_box(d.decode_x8(black_box(&z)).unwrap()))
    });
}

criterion_group!(benches, bench_huffman_o1, bench_rans_o0);
criterion_main!(benches);
