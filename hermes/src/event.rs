// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

// The promise/future pair bridging the progress thread and user threads
// waiting in RpcHandle::get(). Fulfillment is first-writer-wins so that
// exactly one of value/error lands per execution context even when a
// completion races a local timeout resolution.

use log::*;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FutureStatus {
    Ready,
    Timeout,
}

struct Inner<T> {
    slot: Mutex<Option<Result<T, Error>>>,
    cond: Condvar,
}

pub(crate) struct Promise<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) struct OutputFuture<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) fn channel<T>() -> (Promise<T>, OutputFuture<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        cond: Condvar::new(),
    });

    (
        Promise {
            inner: Arc::clone(&inner),
        },
        OutputFuture { inner },
    )
}

impl<T> Promise<T> {
    pub(crate) fn set_value(&self, value: T) {
        self.fulfil(Ok(value));
    }

    pub(crate) fn set_error(&self, error: Error) {
        self.fulfil(Err(error));
    }

    fn fulfil(&self, outcome: Result<T, Error>) {
        let mut slot = self.inner.slot.lock().unwrap();

        if slot.is_some() {
            // a racing writer already resolved this context
            trace!("dropping second fulfillment of a promise");
            return;
        }

        *slot = Some(outcome);
        self.inner.cond.notify_all();
    }
}

impl<T> OutputFuture<T> {
    /// Wait until the promise is fulfilled or `timeout` elapses. Callers
    /// track retrieval themselves; waiting on an already-drained future
    /// blocks for the full timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> FutureStatus {
        let slot = self.inner.slot.lock().unwrap();

        let (slot, res) = self
            .inner
            .cond
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap();

        drop(slot);

        if res.timed_out() {
            FutureStatus::Timeout
        } else {
            FutureStatus::Ready
        }
    }

    /// Take the outcome. At most once retrievable; `None` afterwards or
    /// before fulfillment.
    pub(crate) fn try_retrieve(&self) -> Option<Result<T, Error>> {
        self.inner.slot.lock().unwrap().take()
    }
}
