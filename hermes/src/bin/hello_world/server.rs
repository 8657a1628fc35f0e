// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod rpcs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use hermes::{AsyncEngine, EngineOptions, Transport};

#[derive(Parser)]
struct Cli {
    /// Transport-qualified address to listen on, e.g.
    /// ofi+tcp://127.0.0.1:52000 or na+sm:///tmp/hello_world.sock
    address: String,

    /// Log engine statistics on shutdown.
    #[arg(long)]
    stats: bool,
}

/// Split ADDRESS into the transport and the bind address. An address
/// without a prefix defaults to ofi+tcp.
fn parse_address(address: &str) -> Result<(Transport, String), String> {
    let Some(pos) = address.find("://") else {
        eprintln!("WARNING: address does not include a transport prefix, defaulting to ofi+tcp");
        return Ok((Transport::OfiTcp, address.to_string()));
    };

    let scheme = &address[..pos];
    let transport = Transport::from_scheme(scheme)
        .ok_or_else(|| format!("unknown transport '{scheme}'"))?;

    Ok((transport, address[pos + 3..].to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();
    let (transport, bind_address) = parse_address(&args.address)?;

    rpcs::register()?;

    let opts = EngineOptions {
        print_stats: args.stats,
        ..Default::default()
    };

    let engine = AsyncEngine::new(transport, opts, &bind_address, true)?;

    engine.register_handler::<rpcs::SendMessage, _>(|engine, req| {
        println!("RPC received:");
        println!("    type: send_message");
        println!("    args: \"{}\"", req.args().message);

        if req.requires_response() {
            let retval = 36;
            match engine.respond(req, rpcs::MessageRetval { retval }) {
                Ok(()) => println!("  Response sent with value {retval}"),
                Err(e) => eprintln!("  Failed to respond: {e}"),
            }
        }
    })?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown_requested);

    engine.register_handler::<rpcs::Shutdown, _>(move |_engine, req| {
        println!("RPC received:");
        println!("    type: shutdown");
        println!("  requires_response? {}", req.requires_response());

        flag.store(true, Ordering::Release);
    })?;

    println!("Listening for requests on {}", engine.self_address()?);

    engine.run();

    while !shutdown_requested.load(Ordering::Acquire) {
        // the server could do actual useful work here while the engine
        // processes rpcs and invokes handlers
        std::thread::sleep(Duration::from_secs(1));
    }

    println!("Shutting down");

    Ok(())
}
