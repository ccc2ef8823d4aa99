use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rdbkit::*;

fn bench_resp(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp");
    group.bench_function("parse_many_1k_replies", |b| {
        let mut buf = BytesMut::new();
        for i in 0..1000 {
            match i % 3 {
                0 => buf.extend_from_slice(b"+OK\r\n"),
                1 => buf.extend_from_slice(format!(":{}\r\n", i).as_bytes()),
                _ => buf.extend_from_slice(format!("${}\r\nval{}\r\n", 3 + i.to_string().len(), i).as_bytes()),
            }
        }
        b.iter(|| {
            let mut tmp = buf.clone();
            let mut out = Vec::new();
            protocol::parse_many(&mut tmp, &mut out).unwrap();
            black_box(out.len());
        });
    });
    group.bench_function("write_command_1k", |b| {
        let args: Vec<Vec<u8>> = vec![b"HSET".to_vec(), b"key".to_vec(), b"field".to_vec(), vec![b'v'; 64]];
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(128 * 1024);
            for _ in 0..1000 {
                protocol::write_command(&mut buf, &args);
            }
            black_box(buf.len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_resp);
criterion_main!(benches);
