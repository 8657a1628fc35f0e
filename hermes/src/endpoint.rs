// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// A reachable address on the engine's transport, produced by `lookup`.
/// Cheap to clone; clones share the underlying native address descriptor.
#[derive(Clone)]
pub struct Endpoint {
    addr: na::Addr,
}

pub type EndpointSet = Vec<Endpoint>;

impl Endpoint {
    pub(crate) fn new(addr: na::Addr) -> Endpoint {
        Endpoint { addr }
    }

    /// The transport-qualified textual address.
    pub fn uri(&self) -> &str {
        self.addr.uri()
    }

    pub(crate) fn address(&self) -> &na::Addr {
        &self.addr
    }
}

/// Two endpoints are equal when they share the same native address
/// descriptor (as two results of looking up the same address do).
impl PartialEq for Endpoint {
    fn eq(&self, other: &Endpoint) -> bool {
        self.addr.same_descriptor(&other.addr)
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Endpoint({})", self.addr)
    }
}
