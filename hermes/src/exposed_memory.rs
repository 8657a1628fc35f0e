// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use crate::buffer::MutableBuffer;
use crate::{Error, Result};

/// Access rights attached to exposed memory. Maps 1:1 to the native
/// bulk-permission flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl From<AccessMode> for na::BulkFlags {
    fn from(mode: AccessMode) -> na::BulkFlags {
        match mode {
            AccessMode::ReadOnly => na::BulkFlags::ReadOnly,
            AccessMode::WriteOnly => na::BulkFlags::WriteOnly,
            AccessMode::ReadWrite => na::BulkFlags::ReadWrite,
        }
    }
}

/// A set of memory segments registered with the transport for one-sided
/// transfers. Copies share the underlying native descriptor through its
/// reference count; the last copy dropping releases the registration.
#[derive(Clone)]
pub struct ExposedMemory {
    bulk: na::Bulk,
    buffers: Vec<MutableBuffer>,
    mode: AccessMode,
}

impl ExposedMemory {
    /// Register `buffers` as one bulk unit. Used by the engine's `expose`.
    pub(crate) fn expose(
        class: &Arc<na::Class>,
        buffers: &[MutableBuffer],
        mode: AccessMode,
    ) -> Result<ExposedMemory> {
        let segments: Vec<na::Segment> = buffers
            .iter()
            .map(|b| na::Segment::new(b.data(), b.size()))
            .collect();

        // SAFETY: per the MutableBuffer contract, the caller keeps the
        // described memory alive and accessible while any exposure built
        // from it exists, which bounds the descriptor's lifetime.
        let bulk = unsafe { na::Bulk::create(class, segments, mode.into()) }
            .map_err(Error::Native)?;

        Ok(ExposedMemory {
            bulk,
            buffers: buffers.to_vec(),
            mode,
        })
    }

    /// Number of memory segments exposed.
    pub fn count(&self) -> usize {
        self.bulk.segment_count() as usize
    }

    /// Accumulated size of the memory segments exposed.
    pub fn size(&self) -> u64 {
        self.bulk.size()
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    /// Per-segment sizes, in exposure order. Valid for local and inbound
    /// descriptors alike.
    pub fn segment_sizes(&self) -> Vec<u64> {
        self.bulk.segment_sizes()
    }

    /// The local buffers behind this exposure. Empty for descriptors that
    /// arrived over the wire; their segments live in the origin process.
    pub fn buffers(&self) -> &[MutableBuffer] {
        &self.buffers
    }

    /// Explicit conversion to the native descriptor, for serialization.
    /// Bumps the native reference count by one.
    pub fn to_native_bulk(&self) -> na::Bulk {
        self.bulk.clone()
    }

    /// Encode the wire form of the underlying descriptor.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.bulk.encode(buf).map_err(Error::Native)
    }

    /// Decode an inbound descriptor. The wire form does not carry the
    /// sender's access mode, so segments are recorded as read-write; the
    /// origin enforces its declared mode when transfers are served.
    pub fn decode(input: &mut &[u8]) -> Result<ExposedMemory> {
        let bulk = na::Bulk::decode(input)?;

        Ok(ExposedMemory {
            bulk,
            buffers: Vec::new(),
            mode: AccessMode::ReadWrite,
        })
    }
}
