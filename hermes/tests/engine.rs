// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hermes::codec::*;
use hermes::{
    register_request_type, AccessMode, AsyncEngine, EngineOptions, Error, MutableBuffer,
    RequestType, Result, Transport,
};

#[derive(Clone)]
pub struct MessageArgs {
    pub message: String,
}

#[derive(Debug)]
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

enum SendMessage {}

impl RequestType for SendMessage {
    const ID: u16 = 42;
    const NAME: &'static str = "send_message";
    const REQUIRES_RESPONSE: bool = true;

    type Input = MessageArgs;
    type Output = Retval;

    fn encode_input(input: &MessageArgs, buf: &mut Vec<u8>) -> Result<()> {
        put_str(buf, &input.message);
        Ok(())
    }

    fn decode_input(input: &mut &[u8]) -> Result<MessageArgs> {
        let mut message = String::new();
        get_string(&mut message, input)?;
        Ok(MessageArgs { message })
    }

    fn encode_output(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
        encode_retval(output, buf)
    }

    fn decode_output(input: &mut &[u8]) -> Result<Retval> {
        decode_retval(input)
    }
}

/// Echoes the byte length of the message back to the origin.
enum EchoLength {}

impl RequestType for EchoLength {
    const ID: u16 = 43;
    const NAME: &'static str = "echo_length";
    const REQUIRES_RESPONSE: bool = true;

    type Input = MessageArgs;
    type Output = Retval;

    fn encode_input(input: &MessageArgs, buf: &mut Vec<u8>) -> Result<()> {
        put_str(buf, &input.message);
        Ok(())
    }

    fn decode_input(input: &mut &[u8]) -> Result<MessageArgs> {
        let mut message = String::new();
        get_string(&mut message, input)?;
        Ok(MessageArgs { message })
    }

    fn encode_output(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
        encode_retval(output, buf)
    }

    fn decode_output(input: &mut &[u8]) -> Result<Retval> {
        decode_retval(input)
    }
}

enum Shutdown {}

impl RequestType for Shutdown {
    const ID: u16 = 45;
    const NAME: &'static str = "shutdown";
    const REQUIRES_RESPONSE: bool = false;

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

fn register_all() {
    register_request_type::<SendMessage>().unwrap();
    register_request_type::<EchoLength>().unwrap();
    register_request_type::<Shutdown>().unwrap();
}

fn listening_engine() -> AsyncEngine {
    AsyncEngine::new(Transport::OfiTcp, EngineOptions::default(), "127.0.0.1:0", true).unwrap()
}

fn client_engine() -> AsyncEngine {
    AsyncEngine::new(Transport::OfiTcp, EngineOptions::default(), "", false).unwrap()
}

#[test]
fn hello_world_roundtrip() {
    register_all();

    let server = listening_engine();

    server
        .register_handler::<SendMessage, _>(|engine, req| {
            if req.requires_response() {
                let _ = engine.respond(req, Retval { retval: 36 });
            }
        })
        .unwrap();

    server.run();

    let client = client_engine();
    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    let mut rpc = client
        .post::<SendMessage>(
            &endpoint,
            MessageArgs {
                message: "Hello world!!!".to_string(),
            },
        )
        .unwrap();

    let results = rpc.get().unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retval, 36);
}

#[test]
fn handler_result_is_computed_from_the_input() {
    register_all();

    let server = listening_engine();

    server
        .register_handler::<EchoLength, _>(|engine, req| {
            let retval = req.args().message.len() as i32;
            let _ = engine.respond(req, Retval { retval });
        })
        .unwrap();

    server.run();

    let client = client_engine();
    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    for message in ["a", "forty-four", "These are the contents of an example buffer"] {
        let mut rpc = client
            .post::<EchoLength>(
                &endpoint,
                MessageArgs {
                    message: message.to_string(),
                },
            )
            .unwrap();

        let results = rpc.get().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].retval, message.len() as i32);
    }
}

#[test]
fn one_way_shutdown() {
    register_all();

    let server = listening_engine();

    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);

    server
        .register_handler::<Shutdown, _>(move |_engine, req| {
            if !req.requires_response() {
                flag.store(true, Ordering::Release);
            }
        })
        .unwrap();

    server.run();

    let client = client_engine();
    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    {
        let mut rpc = client.post::<Shutdown>(&endpoint, ()).unwrap();

        // a one-way request has no response to get
        match rpc.get() {
            Err(Error::NoResponseExpected(name)) => assert_eq!(name, "shutdown"),
            other => panic!("expected NoResponseExpected, got {other:?}"),
        }

        let before = Instant::now();
        drop(rpc);
        // the destructor must not await a response
        assert!(before.elapsed() < Duration::from_secs(5));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while !observed.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "handler never observed shutdown");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn broadcast_deduplicates_endpoints() {
    register_all();

    let server = listening_engine();

    server
        .register_handler::<SendMessage, _>(|engine, req| {
            if req.requires_response() {
                let _ = engine.respond(req, Retval { retval: 36 });
            }
        })
        .unwrap();

    server.run();

    let client = client_engine();
    client.run();

    let addr = server.self_address().unwrap();
    let endpoints = client.lookup_all([addr.clone(), addr]).unwrap();
    assert_eq!(endpoints.len(), 1);

    let mut rpc = client
        .broadcast::<SendMessage>(
            &endpoints,
            MessageArgs {
                message: "hi".to_string(),
            },
        )
        .unwrap();

    let results = rpc.get().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retval, 36);
}

#[test]
fn lookup_is_cached() {
    register_all();

    let server = listening_engine();
    server.run();

    let client = client_engine();
    let addr = server.self_address().unwrap();

    let first = client.lookup(&addr).unwrap();
    let second = client.lookup(&addr).unwrap();

    // both endpoints share the same native address descriptor
    assert_eq!(first, second);
}

#[test]
fn lookup_prepends_the_engine_prefix() {
    register_all();

    let server = listening_engine();
    server.run();

    let addr = server.self_address().unwrap();
    let body = addr.strip_prefix("ofi+tcp://").unwrap();

    let client = client_engine();
    let endpoint = client.lookup(body).unwrap();

    assert_eq!(endpoint.uri(), addr);
}

#[test]
fn lookup_enforces_the_transport_prefix() {
    register_all();

    let client = client_engine();

    match client.lookup("na+sm:///tmp/nowhere.sock") {
        Err(Error::TransportMismatch { found, expected }) => {
            assert_eq!(found, "na+sm");
            assert_eq!(expected, "ofi+tcp");
        }
        other => panic!("expected TransportMismatch, got {other:?}"),
    }
}

#[test]
fn verbs_accepts_the_rxm_form() {
    assert!(Transport::OfiVerbs.matches_scheme("ofi+verbs"));
    assert!(Transport::OfiVerbs.matches_scheme("ofi+verbs;ofi_rxm"));
    assert!(!Transport::OfiVerbs.matches_scheme("ofi+tcp"));
    assert!(!Transport::OfiTcp.matches_scheme("ofi+verbs;ofi_rxm"));
    assert_eq!(Transport::OfiVerbs.lookup_prefix(), "ofi+verbs;ofi_rxm://");
}

#[test]
fn unsupported_transports_are_rejected_at_init() {
    match AsyncEngine::new(Transport::CciVerbs, EngineOptions::default(), "", false) {
        Err(Error::UnsupportedTransport(t)) => assert_eq!(t, "cci+verbs"),
        other => panic!("expected UnsupportedTransport, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn exposed_memory_accounting() {
    register_all();

    let engine = client_engine();

    let mut a = vec![0u8; 10];
    let mut b = vec![0u8; 20];
    let mut c = vec![0u8; 2];

    let buffers = [
        MutableBuffer::new(a.as_mut_ptr(), a.len()),
        MutableBuffer::new(b.as_mut_ptr(), b.len()),
        MutableBuffer::new(c.as_mut_ptr(), c.len()),
    ];

    let memory = engine.expose(&buffers, AccessMode::ReadOnly).unwrap();

    assert_eq!(memory.count(), 3);
    assert_eq!(memory.size(), 32);
    assert_eq!(memory.segment_sizes(), vec![10, 20, 2]);
    assert_eq!(memory.access_mode(), AccessMode::ReadOnly);
}

#[test]
fn exposed_memory_reference_counting() {
    register_all();

    let engine = client_engine();

    let mut data = vec![7u8; 64];
    let buffers = [MutableBuffer::new(data.as_mut_ptr(), data.len())];

    let memory = engine.expose(&buffers, AccessMode::ReadWrite).unwrap();

    // conversion to the wire form bumps the count by exactly one
    let first = memory.to_native_bulk();
    let baseline = first.ref_count();
    let second = memory.to_native_bulk();
    assert_eq!(second.ref_count(), baseline + 1);
    drop(second);
    assert_eq!(first.ref_count(), baseline);

    // copying the exposure and dropping the copy never releases the bulk
    let copy = memory.clone();
    assert_eq!(first.ref_count(), baseline + 1);
    drop(copy);
    assert_eq!(first.ref_count(), baseline);
    assert_eq!(memory.size(), 64);
}

enum First {}
enum Conflicting {}

impl RequestType for First {
    const ID: u16 = 200;
    const NAME: &'static str = "first";
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

impl RequestType for Conflicting {
    const ID: u16 = 200;
    const NAME: &'static str = "conflicting";
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

#[test]
fn registration_is_idempotent_but_conflicts_fail() {
    register_request_type::<First>().unwrap();
    register_request_type::<First>().unwrap();

    match register_request_type::<Conflicting>() {
        Err(Error::ConflictingRequestType(id)) => assert_eq!(id, 200),
        other => panic!("expected ConflictingRequestType, got {other:?}"),
    }
}

enum NeverRegistered {}

impl RequestType for NeverRegistered {
    const ID: u16 = 201;
    const NAME: &'static str = "never_registered";
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

#[test]
fn handler_registration_requires_a_registered_type() {
    register_all();

    let engine = client_engine();

    match engine.register_handler::<NeverRegistered, _>(|_, _req| {}) {
        Err(Error::UnknownRequestType(id)) => assert_eq!(id, 201),
        other => panic!("expected UnknownRequestType, got {other:?}"),
    }
}
