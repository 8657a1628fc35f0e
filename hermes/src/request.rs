// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use crate::registry::RequestType;
use crate::{Error, Result};

/// A request as seen by the target: the decoded input, the native handle
/// needed to respond, and the requires-response flag copied from the
/// request type's declaration.
///
/// Move-only. Dropping a request releases its native handle, whether or not
/// a response was sent.
pub struct Request<R: RequestType> {
    args: R::Input,
    requires_response: bool,
    handle: Option<Arc<na::Handle>>,
}

impl<R: RequestType> Request<R> {
    /// Decode the serialized input owned by `handle`. The serialized form
    /// is freed once decoding finishes; only the decoded input is kept.
    pub(crate) fn from_native(mut handle: na::Handle) -> Result<Request<R>> {
        let input = handle
            .take_input()
            .ok_or(Error::RequestFailed("request input missing".to_string()))?;

        let payload = {
            #[cfg(feature = "margo-compat")]
            {
                if input.len() < crate::margo::BREADCRUMB_SIZE {
                    return Err(Error::Decode(na::codec::DecodeError));
                }
                &input[crate::margo::BREADCRUMB_SIZE..]
            }
            #[cfg(not(feature = "margo-compat"))]
            {
                input.as_slice()
            }
        };

        let mut slice = payload;
        let args = R::decode_input(&mut slice)?;

        Ok(Request {
            args,
            requires_response: R::REQUIRES_RESPONSE,
            handle: Some(Arc::new(handle)),
        })
    }

    /// The decoded input.
    pub fn args(&self) -> &R::Input {
        &self.args
    }

    pub fn requires_response(&self) -> bool {
        self.requires_response
    }

    pub(crate) fn native_handle(&self) -> Result<&Arc<na::Handle>> {
        self.handle.as_ref().ok_or(Error::InconsistentState)
    }
}
