//! Performance benchmarks for output fan-out.
//!
//! These benchmarks measure the hot paths between a process and its viewers:
//! - Broadcasting a chunk to subscriber queues with room
//! - Broadcasting to saturated queues (the drop path)
//! - Encoding output envelopes for the IPC socket

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use ptymux_daemon::protocol::TerminalMessage;
use ptymux_daemon::session::multiplexer::{SubscriberHandle, SubscriberSet, SubscriberStream};

/// Builds a set of `count` subscribers, keeping their streams alive.
fn subscriber_set(count: usize, capacity: usize) -> (SubscriberSet, Vec<SubscriberStream>) {
    let mut set = SubscriberSet::new();
    let mut streams = Vec::with_capacity(count);
    for _ in 0..count {
        let (handle, stream) = SubscriberHandle::new("bench".to_string(), capacity);
        set.insert(handle);
        streams.push(stream);
    }
    (set, streams)
}

/// Benchmark broadcasting to subscribers with free queue space.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let chunk = Bytes::from(vec![b'x'; 4096]);

    for count in [1usize, 8, 64] {
        group.throughput(Throughput::Bytes((chunk.len() * count) as u64));
        group.bench_function(format!("{}_subscribers_4KB", count), |b| {
            b.iter_batched(
                || subscriber_set(count, 256),
                |(mut set, streams)| {
                    let delivered = set.broadcast(black_box(&chunk));
                    (set, streams, delivered)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark broadcasting when every queue is full.
fn bench_broadcast_saturated(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_saturated");
    let chunk = Bytes::from(vec![b'x'; 4096]);

    for count in [1usize, 8, 64] {
        let (mut set, _streams) = subscriber_set(count, 1);
        set.broadcast(&chunk);

        group.bench_function(format!("{}_subscribers", count), |b| {
            b.iter(|| set.broadcast(black_box(&chunk)));
        });
    }

    group.finish();
}

/// Benchmark JSON encoding of output envelopes.
fn bench_output_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_envelope");

    for size in [1usize, 4096] {
        let message = TerminalMessage::output("bench", vec![b'x'; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{}B", size), |b| {
            b.iter(|| black_box(&message).to_json());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_broadcast,
    bench_broadcast_saturated,
    bench_output_envelope
);
criterion_main!(benches);
