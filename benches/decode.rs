use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rdbkit::*;

/// A snapshot of `keys` string keys and one large plain hash
fn snapshot(keys: usize) -> Vec<u8> {
    let mut out = b"REDIS0009\xFE\x00".to_vec();
    for i in 0..keys {
        let k = format!("key:{}", i);
        let v = format!("value-{}-{}", i, "x".repeat(i % 40));
        out.push(0x00);
        out.push(k.len() as u8);
        out.extend_from_slice(k.as_bytes());
        out.push(v.len() as u8);
        out.extend_from_slice(v.as_bytes());
    }
    out.push(0x04);
    out.push(4);
    out.extend_from_slice(b"hash");
    // 1000 fields as a 14 bit length
    out.extend_from_slice(&[0x40 | (1000 >> 8) as u8, (1000 & 0xff) as u8]);
    for i in 0..1000 {
        let f = format!("f{}", i);
        out.push(f.len() as u8);
        out.extend_from_slice(f.as_bytes());
        out.push(0xC0); // int8 literal
        out.push((i % 128) as u8);
    }
    out.push(0xFF);
    out
}

fn bench_decode(c: &mut Criterion) {
    let data = snapshot(10_000);
    let mut group = c.benchmark_group("decode");
    group.bench_function("count_10k_keys", |b| {
        b.iter(|| {
            let mut n = 0u64;
            parse(
                &data[..],
                FnHandler(|_: &CancelToken, obj: TypeObject| -> Result<()> {
                    n += obj.value_len();
                    Ok(())
                }),
                CancelToken::new(),
                ParseOptions::default(),
            )
            .unwrap();
            black_box(n)
        });
    });
    group.bench_function("json_10k_keys", |b| {
        b.iter_batched(
            || Vec::with_capacity(1 << 20),
            |mut out: Vec<u8>| {
                parse_to_json(&data[..], &mut out, CancelToken::new(), ParseOptions::default()).unwrap();
                black_box(out.len())
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
