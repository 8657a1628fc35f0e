// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::sync::Arc;
use std::time::Duration;

use crate::event::{self, FutureStatus, OutputFuture};
use crate::execution::{ExecutionContext, RequestStatus};
use crate::registry::RequestType;
use crate::{Error, Result};

pub type OutputSet<R> = Vec<<R as RequestType>::Output>;

/// The origin's view of a posted request: one execution context and one
/// future per target. Move-only. For request types that expect a response
/// the destructor drains the futures so that pending work is never dropped;
/// for one-way types it does not await.
pub struct RpcHandle<R: RequestType> {
    pub(crate) ctxs: Vec<Arc<ExecutionContext<R>>>,
    futures: Vec<OutputFuture<R::Output>>,
    retrieved: Vec<bool>,
    retries: Vec<u8>,
}

impl<R: RequestType> RpcHandle<R> {
    pub(crate) fn new(
        context: &Arc<na::Context>,
        targets: Vec<na::Addr>,
        inputs: Vec<R::Input>,
        timeout: Duration,
        retries: u8,
    ) -> Result<RpcHandle<R>> {
        assert_eq!(targets.len(), inputs.len());

        let mut ctxs = Vec::with_capacity(targets.len());
        let mut futures = Vec::with_capacity(targets.len());

        for (address, input) in targets.into_iter().zip(inputs) {
            let (promise, future) = event::channel();

            ctxs.push(ExecutionContext::<R>::new(
                Arc::clone(context),
                address,
                input,
                timeout,
                promise,
            )?);
            futures.push(future);
        }

        let count = ctxs.len();

        Ok(RpcHandle {
            ctxs,
            futures,
            retrieved: vec![false; count],
            retries: vec![retries; count],
        })
    }

    /// Wait for every target's outcome and return the outputs in completion
    /// order. Each wait is bounded by the per-attempt timeout; a timed-out
    /// request is cancelled and resubmitted while retries remain, then
    /// surfaces [`Error::Timeout`].
    ///
    /// Fails immediately for request types that do not expect a response.
    pub fn get(&mut self) -> Result<OutputSet<R>> {
        if !R::REQUIRES_RESPONSE {
            return Err(Error::NoResponseExpected(R::NAME));
        }

        debug_assert_eq!(self.futures.len(), self.ctxs.len());

        let mut results = Vec::new();
        let mut pending = self.retrieved.iter().filter(|r| !**r).count();

        debug!("getting RPC results (pending: {pending})");

        while pending > 0 {
            for i in 0..self.futures.len() {
                if self.retrieved[i] {
                    continue;
                }

                match self.futures[i].wait_timeout(self.ctxs[i].timeout) {
                    FutureStatus::Ready => {
                        self.retrieved[i] = true;
                        pending -= 1;

                        match self.futures[i].try_retrieve() {
                            Some(Ok(value)) => results.push(value),
                            Some(Err(e)) => return Err(e),
                            None => return Err(Error::InconsistentState),
                        }
                    }

                    FutureStatus::Timeout => self.handle_timeout(i),
                }
            }
        }

        Ok(results)
    }

    /// One future timed out: communicate intent to the completion callback
    /// through the context status and cancel the native handle. The
    /// callback observes the cancellation and either reposts (timeout
    /// status) or resolves the future with a timeout error (cancelled
    /// status).
    fn handle_timeout(&mut self, i: usize) {
        let ctx = &self.ctxs[i];

        if ctx.status.load() == RequestStatus::Cancelled {
            // Already cancelled on a previous round and still nothing
            // surfaced; resolve locally so the wait always terminates.
            // First-writer-wins keeps this safe against a late completion.
            ctx.promise.set_error(Error::Timeout);
            return;
        }

        if self.retries[i] > 0 {
            self.retries[i] -= 1;
            ctx.status.store(RequestStatus::Timeout);
            debug!(
                "request [{}] timed out, reposting ({} retries left)",
                R::NAME,
                self.retries[i]
            );
        } else {
            ctx.status.store(RequestStatus::Cancelled);
            debug!("request [{}] timed out, cancelling", R::NAME);
        }

        let guard = ctx.handle.lock().unwrap();

        match guard.as_ref() {
            Some(handle) => {
                if let Err(e) = handle.cancel() {
                    warn!("failed to cancel RPC: {e}");
                }
            }
            // nothing was ever submitted on this context
            None => ctx.promise.set_error(Error::Timeout),
        }
    }

    fn drain(&mut self) {
        // get() always marks at least one future retrieved before failing,
        // so this terminates.
        while self.retrieved.iter().any(|r| !*r) {
            if let Err(e) = self.get() {
                debug!("draining RPC handle: {e}");
            }
        }
    }
}

impl<R: RequestType> Drop for RpcHandle<R> {
    fn drop(&mut self) {
        if R::REQUIRES_RESPONSE && self.retrieved.iter().any(|r| !*r) {
            self.drain();
        }
    }
}
