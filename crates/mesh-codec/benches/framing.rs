use criterion::{criterion_group, criterion_main, Criterion};
use mesh_codec::frame::{decode, encode, Frame, Header};

fn sample_frame() -> Frame {
    let mut header = Header::new(1, 0, vec![0xde, 0xad, 0xbe, 0xef]);
    header.route = vec![1, 2, 3, 4, 5, 6];
    Frame {
        header,
        payload: vec![0x42; 512],
        validator: vec![0x11; 32],
    }
}

fn bench_encode(c: &mut Criterion) {
    let frame = sample_frame();
    c.bench_function("frame encode", |b| b.iter(|| encode(&frame).unwrap()));
}

fn bench_decode(c: &mut Criterion) {
    let encoded = encode(&sample_frame()).unwrap();
    c.bench_function("frame decode", |b| b.iter(|| decode(&encoded).unwrap()));
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
