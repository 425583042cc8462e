use std::sync::Arc;

use advanced_metrics::config::Config;
use advanced_metrics::ingester::Fields;
use advanced_metrics::publisher::Publisher;
use advanced_metrics::tables::{
    Limits, PriorityTable, ReadTable, SampleKey, Samples, Schema, StagingTable,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn nginx_schema() -> Arc<Schema> {
    Arc::new(Config::default().build_schema().expect("default schema"))
}

/// One message per request matching the default schema, cycling through
/// `distinct` values for every string dimension.
fn message(schema: &Schema, i: usize, distinct: usize) -> Vec<u8> {
    let fields: Vec<String> = schema
        .fields()
        .iter()
        .map(|field| {
            if !field.is_dimension() {
                format!("{:x}", 100 + i % 1_000)
            } else if field.transform().is_some() {
                "200".to_string()
            } else {
                format!("\"{}-{}\"", field.name(), i % distinct)
            }
        })
        .collect();
    fields.join(" ").into_bytes()
}

fn bench_sample_key(c: &mut Criterion) {
    c.bench_function("sample_key/pack_8x10", |b| {
        b.iter(|| {
            let mut key = SampleKey::new(80);
            for code in 0..8u32 {
                key.add_key_part(black_box(code * 97), 10).expect("fits");
            }
            black_box(key)
        })
    });

    let mut key = SampleKey::new(80);
    for code in 0..8u32 {
        key.add_key_part(code * 97, 10).expect("fits");
    }
    let widths = [10u32; 8];
    c.bench_function("sample_key/unpack_8x10", |b| {
        b.iter(|| black_box(key.get_key_parts(black_box(&widths))))
    });
}

fn bench_fields(c: &mut Criterion) {
    let schema = nginx_schema();
    let msg = message(&schema, 7, 16);

    c.bench_function("fields/nginx_message", |b| {
        b.iter(|| Fields::new(black_box(&msg)).count())
    });
}

fn bench_staging_add(c: &mut Criterion) {
    let schema = nginx_schema();
    let messages: Vec<Vec<u8>> = (0..256).map(|i| message(&schema, i, 32)).collect();
    let table = StagingTable::new(
        Arc::clone(&schema),
        Limits::new(100_000, 80_000).expect("limits"),
    );

    c.bench_function("staging/add_nginx_message", |b| {
        let mut i = 0;
        b.iter(|| {
            let msg = &messages[i % messages.len()];
            i += 1;
            table.add(Fields::new(black_box(msg))).expect("valid message")
        })
    });
}

fn bench_aggregate_and_decode(c: &mut Criterion) {
    let schema = nginx_schema();
    let staging = StagingTable::new(
        Arc::clone(&schema),
        Limits::new(100_000, 80_000).expect("limits"),
    );
    for i in 0..2_048 {
        staging
            .add(Fields::new(&message(&schema, i, 512)))
            .expect("valid message");
    }
    let (snapshot, lookups) = staging.read_snapshot(true);

    c.bench_function("priority/collapse_and_decode_512", |b| {
        b.iter(|| {
            let mut table = PriorityTable::new(
                Arc::clone(&schema),
                Limits::new(256, 128).expect("limits"),
            );
            snapshot.range(|sample| table.add(sample.clone()));
            table.collapse_samples().expect("collapse");
            black_box(Publisher::metric_sets(lookups.as_deref(), &table).len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_sample_key(c);
    bench_fields(c);
    bench_staging_add(c);
    bench_aggregate_and_decode(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
