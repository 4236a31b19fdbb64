use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use nocturne_core::ws::{self, WS_MAX_FRAME, opcode};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ws_encode");
    for size in [64usize, 4092, 65536] {
        let payload = vec![b'a'; size];
        let mut out = Vec::with_capacity(size + 64);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("message_{size}"), |b| {
            b.iter(|| {
                out.clear();
                ws::encode_message(&mut out, opcode::TEXT, black_box(&payload));
                black_box(out.len())
            })
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ws_decode");
    for size in [64usize, 4092, 65536] {
        let payload = vec![b'a'; size];
        let mut wire = Vec::new();
        ws::encode_frame(&mut wire, opcode::BINARY, true, &payload, Some(MASK));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("masked_{size}"), |b| {
            b.iter(|| ws::decode_frame(black_box(&wire), WS_MAX_FRAME).unwrap())
        });
    }
    group.finish();
}

fn bench_unmask(c: &mut Criterion) {
    let mut data = vec![0x5au8; 64 * 1024];
    c.bench_function("ws_unmask_64k", |b| {
        b.iter(|| ws::unmask(black_box(&mut data), MASK, 0))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_unmask);
criterion_main!(benches);
