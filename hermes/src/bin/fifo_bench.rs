//! Fifo throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin fifo_bench [loops]
//!
//! Environment variables:
//!     PRODUCERS=4      Producer thread count for the MPSC pass (default: 4)
//!     PRODUCER_CPU=0   First producer CPU; producer i takes PRODUCER_CPU+i
//!     CONSUMER_CPU=2   Pin the consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use hermes::{Arena, ArenaConfig, Msg, MsgPool, fifo};

const POOL_SIZE: u32 = 256;

fn env_cpu(name: &str, default: usize) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(default))
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn report(label: &str, ops: u64, elapsed: Duration) {
    let ns = elapsed.as_nanos().max(1);
    let ops_per_sec = ops as u128 * 1_000_000_000 / ns;
    let ns_per_op = ns as f64 / ops as f64;
    println!("{label}: {ops_per_sec} ops/s, {ns_per_op:.1} ns/op");
}

/// Single-thread push/pop round trips, first on an empty fifo, then with a
/// resident message so every op works against a non-empty ring.
fn bench_add_rmv(loops: u64) {
    let arena = Arc::new(
        Arena::with_capacity(ArenaConfig {
            msgs: 2,
            fifos: 1,
            data_bytes: 0,
        })
        .unwrap(),
    );
    let (tx, rx) = fifo::channel(&arena, 256).unwrap();

    let mut msg = Msg::alloc(&arena, 0).unwrap();
    let start = Instant::now();
    for i in 0..loops {
        msg.set_arg1(i);
        tx.push(msg);
        msg = rx.pop().expect("just pushed");
    }
    report("add/rmv empty fifo    ", loops, start.elapsed());

    // Park a second message inside; push/pop now rotates the pair.
    tx.push(Msg::alloc(&arena, 0).unwrap());
    let start = Instant::now();
    for i in 0..loops {
        msg.set_arg1(i);
        tx.push(msg);
        msg = rx.pop().expect("fifo is primed");
    }
    report("add/rmv non-empty fifo", loops, start.elapsed());
}

/// P producers each pump `loops` pool-backed messages through one fifo.
fn bench_mpsc(loops: u64, producers: usize, producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let arena = Arc::new(
        Arena::with_capacity(ArenaConfig {
            msgs: producers as u32 * POOL_SIZE,
            fifos: 1 + producers as u32,
            data_bytes: 0,
        })
        .unwrap(),
    );
    let (tx, rx) = fifo::channel(&arena, 1024).unwrap();

    let mut handles = vec![];
    for p in 0..producers {
        let tx = tx.clone();
        let arena = Arc::clone(&arena);
        handles.push(std::thread::spawn(move || {
            pin_to_cpu(producer_cpu.map(|base| base + p));
            let pool = MsgPool::new(&arena, POOL_SIZE, 0).unwrap();
            let mut sent = 0u64;
            while sent < loops {
                match pool.get_msg() {
                    Some(mut msg) => {
                        msg.set_arg1(p as u64);
                        tx.push(msg);
                        sent += 1;
                    }
                    // Pool drained: the consumer hasn't recycled yet.
                    None => hint::spin_loop(),
                }
            }
            // Blocks until the consumer has returned every envelope.
            let _ = pool.close();
        }));
    }

    pin_to_cpu(consumer_cpu);
    let total = loops * producers as u64;
    let mut received = 0u64;
    let start = Instant::now();
    while received < total {
        match rx.pop() {
            Some(msg) => {
                msg.ret();
                received += 1;
            }
            None => hint::spin_loop(),
        }
    }
    report("mpsc pool round trip  ", total, start.elapsed());

    for h in handles {
        h.join().unwrap();
    }
}

fn main() {
    hermes::trace::init_tracing();

    let loops: u64 = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1 << 20);
    let producers: usize = env::var("PRODUCERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let producer_cpu = env_cpu("PRODUCER_CPU", 0);
    let consumer_cpu = env_cpu("CONSUMER_CPU", 2);

    println!("loops={loops} producers={producers}");
    bench_add_rmv(loops);
    bench_mpsc(loops, producers, producer_cpu, consumer_cpu);
}
