// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::context::{ConnId, Shared};

/// A resolved peer address. Reference counted: clones share the underlying
/// connection, and the last owner dropping closes it.
#[derive(Clone)]
pub struct Addr {
    inner: Arc<AddrInner>,
}

pub(crate) struct AddrInner {
    uri: String,
    conn: Option<ConnId>,
    shared: Weak<Shared>,
}

impl Addr {
    pub(crate) fn connected(uri: String, conn: ConnId, shared: Weak<Shared>) -> Addr {
        Addr {
            inner: Arc::new(AddrInner {
                uri,
                conn: Some(conn),
                shared,
            }),
        }
    }

    /// A self address: purely textual, with no connection behind it.
    pub(crate) fn unconnected(uri: String) -> Addr {
        Addr {
            inner: Arc::new(AddrInner {
                uri,
                conn: None,
                shared: Weak::new(),
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Whether two addresses share the same underlying descriptor.
    pub fn same_descriptor(&self, other: &Addr) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn conn_id(&self) -> Option<ConnId> {
        self.inner.conn
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.inner.uri)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Addr({})", self.inner.uri)
    }
}

impl Drop for AddrInner {
    fn drop(&mut self) {
        if let (Some(conn), Some(shared)) = (self.conn, self.shared.upgrade()) {
            Shared::close_conn(&shared, conn);
        }
    }
}
