// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// Origin-side per-request state and the forward completion state machine.

use log::*;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::Promise;
use crate::registry::{self, RequestType};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RequestStatus {
    Created = 0,

    /// Set by `get()` before cancelling: the completion callback reposts.
    Timeout = 1,

    /// Set by `get()` before cancelling: the completion callback surfaces a
    /// timeout error and releases the handle.
    Cancelled = 2,

    /// Submission failed; the promise already carries the error.
    Failed = 3,
}

pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    fn new(status: RequestStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> RequestStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => RequestStatus::Created,
            1 => RequestStatus::Timeout,
            2 => RequestStatus::Cancelled,
            _ => RequestStatus::Failed,
        }
    }

    pub(crate) fn store(&self, status: RequestStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

/// State for one posted request to one target. Owned by the RPC handle and
/// shared with the forward completion callback; only the progress thread
/// mutates it after submission, except `status`, which user threads write
/// from `get()` to communicate timeout/cancel intent.
pub(crate) struct ExecutionContext<R: RequestType> {
    pub(crate) context: Arc<na::Context>,
    pub(crate) address: na::Addr,
    pub(crate) handle: Mutex<Option<na::Handle>>,
    pub(crate) status: AtomicStatus,
    pub(crate) encoded_input: Vec<u8>,
    pub(crate) promise: Promise<R::Output>,
    pub(crate) timeout: Duration,

    /// The user input is retained for the lifetime of the context so that
    /// any exposed-memory descriptors it contains stay registered until the
    /// target is done with them.
    #[allow(dead_code)]
    pub(crate) input: R::Input,
}

impl<R: RequestType> ExecutionContext<R> {
    pub(crate) fn new(
        context: Arc<na::Context>,
        address: na::Addr,
        input: R::Input,
        timeout: Duration,
        promise: Promise<R::Output>,
    ) -> crate::Result<Arc<ExecutionContext<R>>> {
        let mut encoded_input = Vec::new();

        #[cfg(feature = "margo-compat")]
        encoded_input.extend_from_slice(
            &crate::margo::breadcrumb_set(registry::native_id::<R>()).to_le_bytes(),
        );

        R::encode_input(&input, &mut encoded_input)?;

        Ok(Arc::new(ExecutionContext {
            context,
            address,
            handle: Mutex::new(None),
            status: AtomicStatus::new(RequestStatus::Created),
            encoded_input,
            promise,
            timeout,
            input,
        }))
    }
}

/// Submit (or resubmit) the context's request to the native layer. Creates
/// the native handle on first use and reuses it on repost.
pub(crate) fn submit<R: RequestType>(ctx: &Arc<ExecutionContext<R>>) -> na::Result<()> {
    let mut guard = ctx.handle.lock().unwrap();

    if guard.is_none() {
        *guard = Some(na::Handle::create(
            &ctx.context,
            &ctx.address,
            registry::native_id::<R>(),
        )?);
    }

    let handle = guard.as_ref().unwrap();
    let cb_ctx = Arc::clone(ctx);

    handle.forward(
        &ctx.encoded_input,
        Box::new(move |ret, output| forward_complete(cb_ctx, ret, output)),
    )
}

/// The forward completion state machine, executed on the progress thread.
fn forward_complete<R: RequestType>(
    ctx: Arc<ExecutionContext<R>>,
    ret: na::ReturnCode,
    output: Option<Vec<u8>>,
) {
    match ret {
        na::ReturnCode::Canceled => match ctx.status.load() {
            RequestStatus::Timeout => {
                debug!("request [{}] timed out, reposting", R::NAME);

                if let Err(e) = submit(&ctx) {
                    debug!("failed to repost request: {e}");
                    ctx.promise.set_error(Error::RepostFailed(e));
                    *ctx.handle.lock().unwrap() = None;
                }
            }

            RequestStatus::Cancelled => {
                // the request timed out repeatedly and exhausted its
                // configured retries
                debug!("request [{}] was cancelled", R::NAME);
                ctx.promise.set_error(Error::Timeout);
                *ctx.handle.lock().unwrap() = None;
            }

            _ => {
                debug!("request [{}] is in an inconsistent state", R::NAME);
                ctx.promise.set_error(Error::InconsistentState);
                *ctx.handle.lock().unwrap() = None;
            }
        },

        na::ReturnCode::Success => {
            if R::REQUIRES_RESPONSE {
                let mut slice = output.as_deref().unwrap_or(&[]);

                match R::decode_output(&mut slice) {
                    Ok(value) => ctx.promise.set_value(value),
                    Err(e) => ctx.promise.set_error(e),
                }
            }

            *ctx.handle.lock().unwrap() = None;
        }

        err => {
            debug!("forward request failed: {err}");
            ctx.promise
                .set_error(Error::RequestFailed(err.to_str().to_string()));
            *ctx.handle.lock().unwrap() = None;
        }
    }
}
