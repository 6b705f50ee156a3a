//! Throughput Benchmark for FlashCache
//!
//! This benchmark measures the command line parser, the storage engine
//! and the command handler under various workloads.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashcache::commands::CommandHandler;
use flashcache::connection::ConnectionStats;
use flashcache::protocol::{Command, Parser, StoreMode};
use flashcache::storage::{LruStorage, Storage};
use std::sync::Arc;
use std::time::Duration;

/// Benchmark command line parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_get", |b| {
        let mut parser = Parser::new();
        let line = b"get user:1234\r\n";
        b.iter(|| {
            black_box(parser.parse(black_box(line)).unwrap());
        });
    });

    group.bench_function("parse_set", |b| {
        let mut parser = Parser::new();
        let line = b"set user:1234 0 3600 11 noreply\r\nhello world\r\n";
        b.iter(|| {
            black_box(parser.parse(black_box(line)).unwrap());
        });
    });

    group.bench_function("parse_multi_get", |b| {
        let mut parser = Parser::new();
        let line = b"get k1 k2 k3 k4 k5 k6 k7 k8 k9 k10\r\n";
        b.iter(|| {
            black_box(parser.parse(black_box(line)).unwrap());
        });
    });

    group.finish();
}

/// Benchmark put operations
fn bench_put(c: &mut Criterion) {
    let engine = Arc::new(LruStorage::new(256 * 1024 * 1024));

    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            let value = Bytes::from("small_value");
            engine.put(key, value);
            i += 1;
        });
    });

    group.bench_function("put_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            engine.put(key, value.clone());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark put with a full cache, every insert evicts
fn bench_evict(c: &mut Criterion) {
    let engine = Arc::new(LruStorage::new(1024 * 1024));

    let mut group = c.benchmark_group("evict");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_evicting", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(256));
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            engine.put(key, value.clone());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark get operations
fn bench_get(c: &mut Criterion) {
    let engine = Arc::new(LruStorage::new(64 * 1024 * 1024));

    // Pre-populate with data
    for i in 0..100_000 {
        let key = Bytes::from(format!("key:{}", i));
        let value = Bytes::from(format!("value:{}", i));
        engine.put(key, value);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 100_000));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("missing:{}", i));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark the command handler (80% reads, 20% writes)
fn bench_execute(c: &mut Criterion) {
    let storage = Arc::new(LruStorage::new(64 * 1024 * 1024));
    let handler = CommandHandler::new(storage, Arc::new(ConnectionStats::new()));

    for i in 0..10_000 {
        let body = format!("value:{}", i);
        let command = Command::Store {
            mode: StoreMode::Set,
            key: Bytes::from(format!("key:{}", i)),
            flags: 0,
            exptime: 0,
            bytes: body.len(),
            noreply: false,
        };
        handler.execute(command, body.as_bytes()).unwrap();
    }

    let mut group = c.benchmark_group("execute");
    group.throughput(Throughput::Elements(1));

    group.bench_function("80_get_20_set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 10_000));
            let command = if i % 5 == 0 {
                Command::Store {
                    mode: StoreMode::Set,
                    key,
                    flags: 0,
                    exptime: 0,
                    bytes: 5,
                    noreply: false,
                }
            } else {
                Command::Get { keys: vec![key] }
            };
            black_box(handler.execute(command, b"value").unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let engine = Arc::new(LruStorage::new(64 * 1024 * 1024));
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            let value = Bytes::from("value");
                            engine.put(key.clone(), value);
                            engine.get(&key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(engine.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_put,
    bench_evict,
    bench_get,
    bench_execute,
    bench_concurrent,
);

criterion_main!(benches);
