// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Native transport layer for the Hermes RPC engine.
//!
//! This crate provides the low-level, callback-driven transport that the
//! engine builds on: classes (a bound transport instance), contexts (the
//! progress state), reference-counted addresses and bulk descriptors, and
//! per-operation handles. Completions are made ready by [`Context::progress`]
//! and delivered by [`Context::trigger`], never from inside the call that
//! initiated the operation.

pub mod codec;

mod addr;
mod bulk;
mod class;
mod context;
mod handle;
mod sock;
mod wire;

pub use addr::Addr;
pub use bulk::{Bulk, BulkFlags, Segment};
pub use class::{Class, InitInfo};
pub use context::{BulkOp, Context};
pub use handle::Handle;

use std::fmt;
use std::sync::{OnceLock, RwLock};

pub type Result<T> = std::result::Result<T, Error>;

/// Completion callback for a forwarded request. Receives the result code and,
/// on success for response-bearing requests, the serialized response payload.
pub type ForwardCallback = Box<dyn FnOnce(ReturnCode, Option<Vec<u8>>) + Send>;

/// Completion callback for an address lookup.
pub type LookupCallback = Box<dyn FnOnce(Result<Addr>) + Send>;

/// Completion callback for a bulk transfer.
pub type BulkCallback = Box<dyn FnOnce(ReturnCode) + Send>;

/// Callback registered per RPC id and invoked with the target-side handle
/// when a matching request arrives.
pub type RpcCallback = std::sync::Arc<dyn Fn(Handle) + Send + Sync>;

/// The possible errors reported by the transport layer.
#[derive(Debug)]
pub enum Error {
    /// Nothing became ready within the progress timeout. Expected and benign.
    Timeout,

    /// The requested transport (or address scheme) is not supported by this
    /// build of the library.
    Unsupported(String),

    /// The textual address could not be parsed or resolved.
    InvalidAddress(String),

    /// The peer connection is gone.
    Disconnected,

    /// The peer violated the wire protocol.
    Protocol(&'static str),

    /// A payload failed to decode.
    Decode(codec::DecodeError),

    /// A bulk descriptor was invalid for the attempted operation.
    InvalidBulk(&'static str),

    /// Responding on a handle whose request type has responses disabled.
    ResponseDisabled,

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "progress timed out"),
            Self::Unsupported(s) => write!(f, "unsupported transport: {s}"),
            Self::InvalidAddress(a) => write!(f, "invalid address: {a}"),
            Self::Disconnected => write!(f, "peer disconnected"),
            Self::Protocol(m) => write!(f, "protocol error: {m}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::InvalidBulk(m) => write!(f, "invalid bulk descriptor: {m}"),
            Self::ResponseDisabled => write!(f, "response is disabled for this request type"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<codec::DecodeError> for Error {
    fn from(e: codec::DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Result codes delivered to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,

    /// The operation was cancelled locally before it completed.
    Canceled,

    /// The target does not know the request id.
    NoMatch,

    /// The peer rejected the operation because of the permission flag on the
    /// bulk descriptor involved.
    Access,

    /// The peer no longer exposes the referenced bulk descriptor.
    BadBulk,

    /// The connection went away while the operation was in flight.
    Disconnected,

    /// The peer sent something the protocol does not allow.
    Protocol,
}

impl ReturnCode {
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Canceled => "operation canceled",
            Self::NoMatch => "no matching registered request",
            Self::Access => "permission denied on bulk descriptor",
            Self::BadBulk => "unknown bulk descriptor",
            Self::Disconnected => "peer disconnected",
            Self::Protocol => "protocol error",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Formatter for native-layer log lines.
pub type LogFunction = Box<dyn Fn(&str) + Send + Sync>;

fn log_slot() -> &'static RwLock<Option<LogFunction>> {
    static SLOT: OnceLock<RwLock<Option<LogFunction>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// Install a formatter for the native-layer log channel. When none is
/// installed, lines are forwarded to the `log` facade under target `"na"`.
pub fn set_log_function(f: LogFunction) {
    *log_slot().write().unwrap() = Some(f);
}

pub(crate) fn channel_log(args: fmt::Arguments) {
    let slot = log_slot().read().unwrap();
    match &*slot {
        Some(f) => f(&args.to_string()),
        None => log::debug!(target: "na", "{args}"),
    }
}
