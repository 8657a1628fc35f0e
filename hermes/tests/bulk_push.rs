// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// The recv_buffer scenario over the shared-memory fabric: the client
// exposes two writable buffers, the server maps the requested file
// read-only and pushes its contents into them.

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

enum RecvBuffer {}

impl RequestType for RecvBuffer {
    const ID: u16 = 44;
    const NAME: &'static str = "recv_buffer";
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
fn push_fills_the_client_buffers() {
    register_request_type::<RecvBuffer>().unwrap();

    let dir = tempfile::tempdir().unwrap();

    // the file the server will map and push
    let file_content: Vec<u8> = (0..6000u32).map(|i| (i % 199) as u8).collect();
    let file_path = dir.path().join("payload.bin");
    {
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(&file_content).unwrap();
    }

    let sock_path = dir.path().join("recv_buffer.sock");

    let server = AsyncEngine::new(
        Transport::NaSm,
        EngineOptions::default(),
        sock_path.to_str().unwrap(),
        true,
    )
    .unwrap();

    server
        .register_handler::<RecvBuffer, _>(move |engine, req| {
            let origin = req.args().buffers.clone();

            let mapped = match MappedBuffer::open(&req.args().pathname, AccessMode::ReadOnly) {
                Ok(mapped) => mapped,
                Err(e) => {
                    eprintln!("failed to map {}: {e}", req.args().pathname);
                    let _ = engine.respond(req, Retval { retval: -1 });
                    return;
                }
            };

            let local = engine
                .expose(&[mapped.as_buffer()], AccessMode::ReadOnly)
                .unwrap();
            let local_for_cb = local.clone();

            engine
                .async_push(&local, &origin, req, move |engine, req| {
                    let _ = engine.respond(req, Retval { retval: 42 });

                    // the mapping and its exposure stay alive until here
                    drop(mapped);
                    drop(local_for_cb);
                })
                .unwrap();
        })
        .unwrap();

    server.run();

    let client = AsyncEngine::new(Transport::NaSm, EngineOptions::default(), "", false).unwrap();
    let endpoint = client.lookup(&server.self_address().unwrap()).unwrap();
    client.run();

    // two writable buffers sized from the file
    let mut first = vec![0u8; 2500];
    let mut second = vec![0u8; file_content.len() - first.len()];

    let buffers = [
        MutableBuffer::new(first.as_mut_ptr(), first.len()),
        MutableBuffer::new(second.as_mut_ptr(), second.len()),
    ];

    let exposed = client.expose(&buffers, AccessMode::WriteOnly).unwrap();

    let mut rpc = client
        .post::<RecvBuffer>(
            &endpoint,
            BufferArgs {
                pathname: file_path.to_str().unwrap().to_string(),
                buffers: exposed,
            },
        )
        .unwrap();

    let results = rpc.get().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retval, 42);

    // the push filled both buffers with the server file's contents
    let mut received = first;
    received.extend_from_slice(&second);
    assert_eq!(received, file_content);
}
