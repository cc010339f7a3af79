//! Ring throughput: one command out and one answer back per iteration,
//! plus a full-ring fill/drain cycle
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use smc_comm::layout::{status, AnswerMessage, CommandMessage, MessageType, QUEUE_CAPACITY};
use smc_comm::ring::{RingChannel, SecureRingView, TimeoutReader};
use smc_platform::PAGE_SIZE;

fn page() -> Box<[u64]> {
    vec![0u64; PAGE_SIZE / 8].into_boxed_slice()
}

fn ring_bench(c: &mut Criterion) {
    let mut buf = page();
    let addr = buf.as_mut_ptr() as usize;
    // SAFETY: `buf` is a zeroed page that outlives both views.
    let (mut ring, peer) = unsafe { (RingChannel::from_raw(addr), SecureRingView::from_raw(addr)) };
    let cmd = CommandMessage::new(MessageType::InvokeClientCommand).with_body(&[7]);
    let answer = AnswerMessage::new(MessageType::InvokeClientCommand, 1, status::S_SUCCESS);

    c.bench_function("ring-round-trip", |b| {
        b.iter(|| {
            ring.try_enqueue(black_box(&cmd)).ok();
            let got = peer.pop_command();
            peer.push_answer(&answer).ok();
            black_box((got, ring.pop_answer()))
        })
    });

    c.bench_function("ring-fill-drain", |b| {
        b.iter(|| {
            for _ in 0..QUEUE_CAPACITY {
                ring.try_enqueue(&cmd).ok();
            }
            while let Some(cmd) = peer.pop_command() {
                black_box(cmd);
            }
        })
    });

    let reader: TimeoutReader = ring.timeout_reader();
    peer.write_timeout(1_000);
    c.bench_function("timeout-read", |b| b.iter(|| black_box(reader.read())));
}

criterion_group!(benches, ring_bench);
criterion_main!(benches);
