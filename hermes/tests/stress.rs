//! Cross-thread stress tests: many producers, one consumer, pool-backed
//! envelopes, and the request/response protocol under real contention.

use std::sync::Arc;
use std::thread;

use hermes::{Arena, ArenaConfig, MsgPool, fifo};

const PRODUCERS: usize = 4;
const PER_PRODUCER: u64 = 5_000;
const POOL_SIZE: u32 = 64;

/// P producers pump origin-tagged messages through a deliberately tiny ring
/// while the consumer drains concurrently, forcing constant degrade/recover
/// cycles. Every message must arrive exactly once.
#[test]
fn many_producers_one_consumer_lose_nothing() {
    let arena = Arc::new(
        Arena::with_capacity(ArenaConfig {
            msgs: PRODUCERS as u32 * POOL_SIZE,
            fifos: 1 + PRODUCERS as u32,
            data_bytes: 0,
        })
        .unwrap(),
    );
    let (tx, rx) = fifo::channel(&arena, 4).unwrap();

    let mut producers = vec![];
    for p in 0..PRODUCERS {
        let tx = tx.clone();
        let arena = Arc::clone(&arena);
        producers.push(thread::spawn(move || {
            let pool = MsgPool::new(&arena, POOL_SIZE, 0).unwrap();
            let mut seq = 0u64;
            while seq < PER_PRODUCER {
                match pool.get_msg() {
                    Some(mut msg) => {
                        msg.set_arg1(p as u64);
                        msg.set_arg2(seq);
                        tx.push(msg);
                        seq += 1;
                    }
                    // All envelopes in flight; wait for the consumer to
                    // recycle some.
                    None => thread::yield_now(),
                }
            }
            let _ = pool.close();
        }));
    }

    let total = PRODUCERS as u64 * PER_PRODUCER;
    let mut seen = vec![vec![false; PER_PRODUCER as usize]; PRODUCERS];
    let mut received = 0u64;
    while received < total {
        match rx.pop() {
            Some(msg) => {
                let origin = msg.arg1() as usize;
                let seq = msg.arg2() as usize;
                assert!(!seen[origin][seq], "duplicate from {origin} at {seq}");
                seen[origin][seq] = true;
                msg.ret();
                received += 1;
            }
            None => thread::yield_now(),
        }
    }
    assert!(rx.pop().is_none());

    for p in producers {
        p.join().unwrap();
    }
    for (origin, flags) in seen.iter().enumerate() {
        assert!(
            flags.iter().all(|&f| f),
            "messages dropped from origin {origin}"
        );
    }
}

/// Two clients fire pooled requests at one server; each response comes back
/// on the client's own queue carrying the computed result, and every
/// envelope ends up home again.
#[test]
fn request_response_round_trip() {
    const CLIENTS: usize = 2;
    const REQUESTS: u64 = 2_000;
    const CLIENT_POOL: u32 = 8;

    let arena = Arc::new(
        Arena::with_capacity(ArenaConfig {
            msgs: CLIENTS as u32 * CLIENT_POOL,
            fifos: 1 + 2 * CLIENTS as u32,
            data_bytes: 0,
        })
        .unwrap(),
    );
    let (req_tx, req_rx) = fifo::channel(&arena, 16).unwrap();

    let server = thread::spawn(move || {
        let mut served = 0u64;
        while served < CLIENTS as u64 * REQUESTS {
            match req_rx.pop() {
                Some(msg) => {
                    let payload = msg.arg2();
                    msg.respond_or_ret(payload * 2);
                    served += 1;
                }
                None => thread::yield_now(),
            }
        }
    });

    let mut clients = vec![];
    for _ in 0..CLIENTS {
        let req_tx = req_tx.clone();
        let arena = Arc::clone(&arena);
        clients.push(thread::spawn(move || {
            let pool = MsgPool::new(&arena, CLIENT_POOL, 0).unwrap();
            let (rsp_tx, rsp_rx) = fifo::channel(&arena, 16).unwrap();

            let mut sent = 0u64;
            let mut done = 0u64;
            while done < REQUESTS {
                if sent < REQUESTS {
                    if let Some(mut msg) = pool.get_msg() {
                        msg.set_arg2(sent);
                        msg.set_rsp_queue(&rsp_tx);
                        req_tx.push(msg);
                        sent += 1;
                    }
                }
                match rsp_rx.pop() {
                    Some(msg) => {
                        assert_eq!(msg.arg1(), msg.arg2() * 2);
                        assert!(!msg.has_rsp_queue());
                        msg.ret();
                        done += 1;
                    }
                    None => thread::yield_now(),
                }
            }

            assert_eq!(pool.get_count(), REQUESTS);
            assert_eq!(pool.close(), REQUESTS + u64::from(CLIENT_POOL));
        }));
    }

    for c in clients {
        c.join().unwrap();
    }
    server.join().unwrap();
}

/// The non-stalling pop drives the whole degrade/recover cycle on its own
/// when no producer is mid-push.
#[test]
fn try_pop_handles_overflow_without_stalling() {
    let arena = Arc::new(
        Arena::with_capacity(ArenaConfig {
            msgs: 5,
            fifos: 1,
            data_bytes: 0,
        })
        .unwrap(),
    );
    let (tx, rx) = fifo::channel(&arena, 2).unwrap();

    for i in 1..=5u64 {
        let mut msg = hermes::Msg::alloc(&arena, 0).unwrap();
        msg.set_arg1(i);
        tx.push(msg);
    }
    for i in 1..=5u64 {
        assert_eq!(rx.try_pop().map(|m| m.arg1()), Some(i));
    }
    assert!(rx.try_pop().is_none());
    assert_eq!(rx.close(), 5);
}
