// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::{Arc, Mutex};

use crate::context::{ConnId, Context, Shared};
use crate::{Addr, Error, ForwardCallback, Result};

enum Kind {
    /// Created by the originator of a request. Reusable: a forward after a
    /// cancel reposts on the same handle.
    Origin {
        addr: Addr,
        rpc_id: u64,
        inflight: Mutex<Option<u64>>,
    },

    /// Created by the transport when a request arrives; owns the serialized
    /// input until the dispatcher takes it.
    Target {
        conn: ConnId,
        cookie: u64,
        response_expected: bool,
        input: Option<Vec<u8>>,
    },
}

/// A per-operation handle. Exclusively owned; dropping it releases the
/// transport-side state without completing the operation.
pub struct Handle {
    shared: Arc<Shared>,
    kind: Kind,
}

impl Handle {
    /// Create an origin-side handle for posting `rpc_id` to `addr`.
    pub fn create(ctx: &Context, addr: &Addr, rpc_id: u64) -> Result<Handle> {
        if addr.conn_id().is_none() {
            return Err(Error::Protocol("address has no connection"));
        }

        Ok(Handle {
            shared: Arc::clone(ctx.shared()),
            kind: Kind::Origin {
                addr: addr.clone(),
                rpc_id,
                inflight: Mutex::new(None),
            },
        })
    }

    pub(crate) fn target(
        shared: Arc<Shared>,
        conn: ConnId,
        cookie: u64,
        response_expected: bool,
        input: Vec<u8>,
    ) -> Handle {
        Handle {
            shared,
            kind: Kind::Target {
                conn,
                cookie,
                response_expected,
                input: Some(input),
            },
        }
    }

    /// Submit the request. `cb` runs exactly once from trigger: with the
    /// response payload, with an error, or with [`crate::ReturnCode::Canceled`]
    /// after a local cancel. For ids with responses disabled the callback
    /// completes as soon as the request is queued.
    pub fn forward(&self, payload: &[u8], cb: ForwardCallback) -> Result<()> {
        let Kind::Origin {
            addr,
            rpc_id,
            inflight,
        } = &self.kind
        else {
            return Err(Error::Protocol("forward on a target-side handle"));
        };

        let conn = addr.conn_id().ok_or(Error::Disconnected)?;
        let expect_response = !self.shared.class.response_disabled(*rpc_id);

        let cookie = self
            .shared
            .submit_forward(conn, *rpc_id, expect_response, payload, cb)?;

        *inflight.lock().unwrap() = expect_response.then_some(cookie);
        Ok(())
    }

    /// Cancel the in-flight forward, if any. The forward callback observes
    /// the cancellation; cancelling a completed or idle handle is a no-op.
    pub fn cancel(&self) -> Result<()> {
        let Kind::Origin { inflight, .. } = &self.kind else {
            return Err(Error::Protocol("cancel on a target-side handle"));
        };

        if let Some(cookie) = inflight.lock().unwrap().take() {
            self.shared.cancel_forward(cookie);
        }

        Ok(())
    }

    /// Send the response for a target-side handle.
    pub fn respond(&self, payload: &[u8]) -> Result<()> {
        let Kind::Target {
            conn,
            cookie,
            response_expected,
            ..
        } = &self.kind
        else {
            return Err(Error::Protocol("respond on an origin-side handle"));
        };

        if !response_expected {
            return Err(Error::ResponseDisabled);
        }

        self.shared.respond(*conn, *cookie, payload)
    }

    /// Take the serialized input of a target-side handle. Present until the
    /// first call.
    pub fn take_input(&mut self) -> Option<Vec<u8>> {
        match &mut self.kind {
            Kind::Target { input, .. } => input.take(),
            Kind::Origin { .. } => None,
        }
    }

    /// Whether the originator expects a response on this handle.
    pub fn response_expected(&self) -> bool {
        match &self.kind {
            Kind::Target {
                response_expected, ..
            } => *response_expected,
            Kind::Origin { rpc_id, .. } => !self.shared.class.response_disabled(*rpc_id),
        }
    }

    pub(crate) fn conn_id(&self) -> Option<ConnId> {
        match &self.kind {
            Kind::Target { conn, .. } => Some(*conn),
            Kind::Origin { addr, .. } => addr.conn_id(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Kind::Origin { inflight, .. } = &self.kind {
            if let Some(cookie) = inflight.lock().unwrap().take() {
                self.shared.forget_forward(cookie);
            }
        }
    }
}
