// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod rpcs;

use clap::Parser;

use hermes::{AsyncEngine, EngineOptions, Transport};

#[derive(Parser)]
struct Cli {
    /// Transport-qualified address of the server, e.g.
    /// ofi+tcp://127.0.0.1:52000
    address: String,

    /// Message to send.
    #[arg(long, default_value = "Hello world!!!")]
    message: String,
}

fn transport_of(address: &str) -> Result<Transport, String> {
    let Some(pos) = address.find("://") else {
        eprintln!("WARNING: address does not include a transport prefix, defaulting to ofi+tcp");
        return Ok(Transport::OfiTcp);
    };

    let scheme = &address[..pos];
    Transport::from_scheme(scheme).ok_or_else(|| format!("unknown transport '{scheme}'"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();
    let transport = transport_of(&args.address)?;

    rpcs::register()?;

    let engine = AsyncEngine::new(transport, EngineOptions::default(), "", false)?;

    let endpoint = engine.lookup(&args.address)?;

    engine.run();

    println!("Sending RPC (send_message, args: \"{}\")", args.message);

    let mut rpc = engine.post::<rpcs::SendMessage>(
        &endpoint,
        rpcs::MessageArgs {
            message: args.message,
        },
    )?;

    println!("Waiting for RPC output...");

    let results = rpc.get()?;

    println!("Output received (size: {})", results.len());

    for rv in &results {
        println!("retval: {}", rv.retval);
    }

    println!("Sending [shutdown]");

    engine.post::<rpcs::Shutdown>(&endpoint, ())?;

    Ok(())
}
