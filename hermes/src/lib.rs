// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Hermes: an asynchronous, typed RPC engine layered over a native
//! transport library.
//!
//! Applications define request types (implementations of [`RequestType`]),
//! register them process-wide with [`register_request_type`], and drive them
//! through an [`AsyncEngine`]: `post`/`broadcast` submit typed requests to
//! remote endpoints and return an [`RpcHandle`] whose `get()` waits for the
//! typed responses; handlers registered with `register_handler` run on the
//! engine's progress thread and answer with `respond`. User memory can be
//! exposed for one-sided transfers ([`ExposedMemory`]) and moved with
//! `async_pull`/`async_push`.

pub mod logging;

mod buffer;
mod endpoint;
mod engine;
mod event;
mod execution;
mod exposed_memory;
mod handle;
#[cfg(feature = "margo-compat")]
mod margo;
mod options;
mod registry;
mod request;
mod transport;

/// Codec helpers request types build their input/output conversions from.
pub use na::codec;

pub use buffer::{MappedBuffer, MutableBuffer};
pub use endpoint::{Endpoint, EndpointSet};
pub use engine::AsyncEngine;
pub use exposed_memory::{AccessMode, ExposedMemory};
pub use handle::{OutputSet, RpcHandle};
pub use options::EngineOptions;
pub use registry::{register_request_type, RequestType};
pub use request::Request;
pub use transport::Transport;

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The errors surfaced by the engine, either synchronously from its public
/// operations or through the futures of an [`RpcHandle`].
#[derive(Debug)]
pub enum Error {
    /// The transport prefix of a looked-up address does not match the
    /// engine's configured transport.
    TransportMismatch { found: String, expected: String },

    /// The engine was asked for a transport this build cannot provide.
    UnsupportedTransport(String),

    /// An operation referenced a request type that was never registered.
    UnknownRequestType(u16),

    /// A request type was registered with metadata conflicting with an
    /// earlier registration of the same id.
    ConflictingRequestType(u16),

    /// `get()` was called on a handle for a request type that does not
    /// expect a response.
    NoResponseExpected(&'static str),

    /// The request timed out after exhausting its configured retries.
    Timeout,

    /// A timed-out request could not be resubmitted.
    RepostFailed(na::Error),

    /// The completion callback observed a cancellation the engine did not
    /// initiate.
    InconsistentState,

    /// The native layer reported a failure while the request was in
    /// transit.
    RequestFailed(String),

    /// A native-layer call failed.
    Native(na::Error),

    /// A payload failed to decode.
    Decode(na::codec::DecodeError),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TransportMismatch { found, expected } => write!(
                f,
                "transport protocol '{found}' in address does not match \
                 engine's configured transport '{expected}'"
            ),
            Self::UnsupportedTransport(t) => write!(f, "unsupported transport: {t}"),
            Self::UnknownRequestType(id) => {
                write!(f, "request type {id} is not registered")
            }
            Self::ConflictingRequestType(id) => {
                write!(f, "conflicting registration for request type {id}")
            }
            Self::NoResponseExpected(name) => write!(
                f,
                "request type [{name}] does not expect a response"
            ),
            Self::Timeout => write!(f, "request timed out"),
            Self::RepostFailed(e) => write!(f, "failed to repost request: {e}"),
            Self::InconsistentState => write!(f, "request is in an inconsistent state"),
            Self::RequestFailed(msg) => write!(f, "request failed: {msg}"),
            Self::Native(e) => write!(f, "native layer error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<na::codec::DecodeError> for Error {
    fn from(e: na::codec::DecodeError) -> Self {
        Self::Decode(e)
    }
}
