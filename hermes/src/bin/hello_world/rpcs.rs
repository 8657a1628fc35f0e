// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// Request types shared by the hello_world client and server.

use hermes::codec::*;
use hermes::{register_request_type, RequestType, Result};

pub struct MessageArgs {
    pub message: String,
}

pub struct MessageRetval {
    pub retval: i32,
}

pub enum SendMessage {}

impl RequestType for SendMessage {
    const ID: u16 = 42;
    const NAME: &'static str = "send_message";
    const REQUIRES_RESPONSE: bool = true;

    type Input = MessageArgs;
    type Output = MessageRetval;

    fn encode_input(input: &MessageArgs, buf: &mut Vec<u8>) -> Result<()> {
        put_str(buf, &input.message);
        Ok(())
    }

    fn decode_input(input: &mut &[u8]) -> Result<MessageArgs> {
        let mut message = String::new();
        get_string(&mut message, input)?;
        Ok(MessageArgs { message })
    }

    fn encode_output(output: &MessageRetval, buf: &mut Vec<u8>) -> Result<()> {
        put_i32(buf, output.retval);
        Ok(())
    }

    fn decode_output(input: &mut &[u8]) -> Result<MessageRetval> {
        let mut retval = 0i32;
        get_i32(&mut retval, input)?;
        Ok(MessageRetval { retval })
    }
}

pub enum Shutdown {}

impl RequestType for Shutdown {
    const ID: u16 = 45;
    const NAME: &'static str = "shutdown";
    const REQUIRES_RESPONSE: bool = false;

    type Input = ();
    type Output = MessageRetval;

    fn encode_input(_input: &(), _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn decode_input(_input: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn encode_output(output: &MessageRetval, buf: &mut Vec<u8>) -> Result<()> {
        put_i32(buf, output.retval);
        Ok(())
    }

    fn decode_output(input: &mut &[u8]) -> Result<MessageRetval> {
        let mut retval = 0i32;
        get_i32(&mut retval, input)?;
        Ok(MessageRetval { retval })
    }
}

pub fn register() -> Result<()> {
    register_request_type::<SendMessage>()?;
    register_request_type::<Shutdown>()?;
    Ok(())
}
