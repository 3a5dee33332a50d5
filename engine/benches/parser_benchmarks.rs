//! Throughput benchmarks for metrics parsing and publication

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use workbench_engine::parser::{parser_for, CompressionCsvParser, KeyValueParser, MetricsParser};
use workbench_engine::publisher::MetricsPublisher;

const COMPRESSORS: &[&str] = &["memcpy", "zstd 1.5.5 -1", "zstd 1.5.5 -9", "lz4 1.9.4", "brotli 2019-10-01 -5"];

/// lzbench-style CSV output with `rows` data rows
fn compression_output(rows: usize) -> String {
    let mut output = String::from(
        "Compressor name,Compression speed,Decompression speed,Original size,Compressed size,Ratio,Filename\n",
    );
    for i in 0..rows {
        output.push_str(&format!(
            "{},{:.2},{:.2},211938580,{},{:.2},silesia.tar\n",
            COMPRESSORS[i % COMPRESSORS.len()],
            400.0 + i as f64,
            1500.0 + i as f64,
            70_000_000 + i,
            34.0 + (i % 10) as f64,
        ));
    }
    output
}

fn key_value_output(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("records_per_sec_{} (+): {}.5 records/s\n", i, 1000 + i))
        .collect()
}

fn bench_compression_csv(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression_csv");

    for rows in [10usize, 100, 1000] {
        let output = compression_output(rows);
        group.throughput(Throughput::Bytes(output.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse", rows), &output, |b, output| {
            b.iter(|| CompressionCsvParser.parse(black_box(output)).unwrap())
        });
    }

    group.finish();
}

fn bench_key_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_value");

    for lines in [10usize, 100, 1000] {
        let output = key_value_output(lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::new("parse", lines), &output, |b, output| {
            b.iter(|| KeyValueParser.parse(black_box(output)).unwrap())
        });
    }

    group.finish();
}

fn bench_parse_and_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let output = compression_output(100);

    c.bench_function("parse_and_publish_100_rows", |b| {
        b.to_async(&rt).iter(|| async {
            let publisher = MetricsPublisher::new("bench-experiment", "bench-agent");
            let parser = parser_for("compression-csv").unwrap();
            publisher
                .parse_and_publish("lzbench", "lzbench", parser.as_ref(), black_box(&output))
                .await
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_compression_csv, bench_key_value, bench_parse_and_publish);
criterion_main!(benches);
