// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// Per-attempt timeout handling: a timed-out request is cancelled and
// resubmitted on the same handle while retries remain, then surfaces a
// timeout error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hermes::codec::*;
use hermes::{
    register_request_type, AsyncEngine, EngineOptions, Error, RequestType, Result, Transport,
};

pub struct Retval {
    pub retval: i32,
}

fn encode_retval(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
    put_i32(buf, output.retval);
    Ok(())
}

fn decode_retval(input: &mut &[u8]) -> Result<Retval> {
    let mut retval = 0i32;
    get_i32(&mut retval, input)?;
    Ok(Retval { retval })
}

/// A request whose handler never responds.
enum BlackHole {}

impl RequestType for BlackHole {
    const ID: u16 = 47;
    const NAME: &'static str = "black_hole";
    const REQUIRES_RESPONSE: bool = true;

    type Input = ();
    type Output = Retval;

    fn encode_input(_input: &(), _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn decode_input(_input: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn encode_output(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
        encode_retval(output, buf)
    }

    fn decode_output(input: &mut &[u8]) -> Result<Retval> {
        decode_retval(input)
    }
}

/// A request whose handler answers only the second attempt.
enum SecondTimeLucky {}

impl RequestType for SecondTimeLucky {
    const ID: u16 = 48;
    const NAME: &'static str = "second_time_lucky";
    const REQUIRES_RESPONSE: bool = true;

    type Input = ();
    type Output = Retval;

    fn encode_input(_input: &(), _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn decode_input(_input: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn encode_output(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
        encode_retval(output, buf)
    }

    fn decode_output(input: &mut &[u8]) -> Result<Retval> {
        decode_retval(input)
    }
}

fn engines(timeout: Duration, retries: u8) -> (AsyncEngine, AsyncEngine) {
    let server = AsyncEngine::new(
        Transport::OfiTcp,
        EngineOptions::default(),
        "127.0.0.1:0",
        true,
    )
    .unwrap();

    let opts = EngineOptions {
        rpc_timeout: timeout,
        rpc_retries: retries,
        ..Default::default()
    };

    let client = AsyncEngine::new(Transport::OfiTcp, opts, "", false).unwrap();

    (server, client)
}

#[test]
fn exhausted_retries_surface_a_timeout() {
    register_request_type::<BlackHole>().unwrap();

    let (server, client) = engines(Duration::from_millis(300), 1);

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);

    server
        .register_handler::<BlackHole, _>(move |_engine, req| {
            counter.fetch_add(1, Ordering::SeqCst);
            // dropping the request without responding releases the handle
            drop(req);
        })
        .unwrap();

    server.run();

    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    let mut rpc = client.post::<BlackHole>(&endpoint, ()).unwrap();

    match rpc.get() {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }

    // one original delivery plus exactly one repost
    let deadline = Instant::now() + Duration::from_secs(5);
    while deliveries.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "repost never reached the server");
        std::thread::sleep(Duration::from_millis(10));
    }

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
}

#[test]
fn a_retry_can_succeed() {
    register_request_type::<SecondTimeLucky>().unwrap();

    let (server, client) = engines(Duration::from_millis(500), 1);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    server
        .register_handler::<SecondTimeLucky, _>(move |engine, req| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;

            if attempt >= 2 {
                let _ = engine.respond(req, Retval { retval: 7 });
            }
        })
        .unwrap();

    server.run();

    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    let mut rpc = client.post::<SecondTimeLucky>(&endpoint, ()).unwrap();

    let results = rpc.get().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retval, 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
