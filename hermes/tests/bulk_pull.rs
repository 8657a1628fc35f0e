// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// The send_buffer scenario: the client exposes a string buffer plus a
// memory-mapped file read-only, the server pulls both into freshly
// allocated buffers and verifies the bytes before responding.

use std::io::Write;

use hermes::codec::*;
use hermes::{
    register_request_type, AccessMode, AsyncEngine, EngineOptions, ExposedMemory, MappedBuffer,
    MutableBuffer, RequestType, Result, Transport,
};

pub struct BufferArgs {
    pub pathname: String,
    pub buffers: ExposedMemory,
}

pub struct Retval {
    pub retval: i32,
}

enum SendBuffer {}

impl RequestType for SendBuffer {
    const ID: u16 = 44;
    const NAME: &'static str = "send_buffer";
    const REQUIRES_RESPONSE: bool = true;

    type Input = BufferArgs;
    type Output = Retval;

    fn encode_input(input: &BufferArgs, buf: &mut Vec<u8>) -> Result<()> {
        put_str(buf, &input.pathname);
        input.buffers.encode(buf)
    }

    fn decode_input(input: &mut &[u8]) -> Result<BufferArgs> {
        let mut pathname = String::new();
        get_string(&mut pathname, input)?;
        let buffers = ExposedMemory::decode(input)?;
        Ok(BufferArgs { pathname, buffers })
    }

    fn encode_output(output: &Retval, buf: &mut Vec<u8>) -> Result<()> {
        put_i32(buf, output.retval);
        Ok(())
    }

    fn decode_output(input: &mut &[u8]) -> Result<Retval> {
        let mut retval = 0i32;
        get_i32(&mut retval, input)?;
        Ok(Retval { retval })
    }
}

#[test]
fn pull_copies_every_byte() {
    register_request_type::<SendBuffer>().unwrap();

    // client-side source data: a 44-byte string and a file
    let mut message = b"These are the contents of an example buffer".to_vec();
    message.push(0);
    assert_eq!(message.len(), 44);

    let file_content: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&file_content).unwrap();
    file.flush().unwrap();

    let mut expected = message.clone();
    expected.extend_from_slice(&file_content);

    let server = AsyncEngine::new(
        Transport::OfiTcp,
        EngineOptions::default(),
        "127.0.0.1:0",
        true,
    )
    .unwrap();

    let handler_expected = expected.clone();

    server
        .register_handler::<SendBuffer, _>(move |engine, req| {
            let pathname_ok = req.args().pathname == "test3a";

            let origin = req.args().buffers.clone();
            let sizes = origin.segment_sizes();

            // matching-sized local buffers, exposed write-only
            let mut locals: Vec<Vec<u8>> = sizes
                .iter()
                .map(|s| vec![0u8; *s as usize])
                .collect();

            let buffers: Vec<MutableBuffer> = locals
                .iter_mut()
                .map(|v| MutableBuffer::new(v.as_mut_ptr(), v.len()))
                .collect();

            let local = engine.expose(&buffers, AccessMode::WriteOnly).unwrap();

            let local_for_cb = local.clone();
            let expected = handler_expected.clone();

            engine
                .async_pull(&origin, &local, req, move |engine, req| {
                    let mut pulled = Vec::new();
                    for v in &locals {
                        pulled.extend_from_slice(v);
                    }

                    let retval = if pulled == expected && pathname_ok { 42 } else { -1 };
                    let _ = engine.respond(req, Retval { retval });

                    // locals and the exposure stay alive until here
                    drop(local_for_cb);
                })
                .unwrap();
        })
        .unwrap();

    server.run();

    let client = AsyncEngine::new(Transport::OfiTcp, EngineOptions::default(), "", false).unwrap();
    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    let mapped = MappedBuffer::open(file.path(), AccessMode::ReadOnly).unwrap();
    assert_eq!(mapped.size(), file_content.len());

    let buffers = [
        MutableBuffer::new(message.as_mut_ptr(), message.len()),
        mapped.as_buffer(),
    ];

    let exposed = client.expose(&buffers, AccessMode::ReadOnly).unwrap();
    assert_eq!(exposed.count(), 2);
    assert_eq!(exposed.size(), 44 + file_content.len() as u64);

    let mut rpc = client
        .post::<SendBuffer>(
            &endpoint,
            BufferArgs {
                pathname: "test3a".to_string(),
                buffers: exposed,
            },
        )
        .unwrap();

    let results = rpc.get().unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retval, 42, "server saw different bytes");
}

#[test]
fn zero_size_descriptors_are_rejected() {
    register_request_type::<SendBuffer>().unwrap();

    let engine =
        AsyncEngine::new(Transport::OfiTcp, EngineOptions::default(), "", false).unwrap();

    let mut data = vec![1u8; 16];
    let buffers = [MutableBuffer::new(data.as_mut_ptr(), data.len())];
    let memory = engine.expose(&buffers, AccessMode::ReadWrite).unwrap();

    // an inbound descriptor of zero size cannot even be decoded
    let mut buf = Vec::new();
    memory.encode(&mut buf).unwrap();

    let mut tampered = Vec::new();
    put_u64(&mut tampered, 1);
    put_u64(&mut tampered, 0);
    put_u32(&mut tampered, 0);

    let mut input = tampered.as_slice();
    assert!(ExposedMemory::decode(&mut input).is_err());

    let mut input = buf.as_slice();
    assert!(ExposedMemory::decode(&mut input).is_ok());
}
