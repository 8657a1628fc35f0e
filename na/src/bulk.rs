// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::{Arc, Weak};

use crate::codec::{get_u32, get_u64, put_u32, put_u64, DecodeError};
use crate::{Class, Error, Result};

/// Permission flag attached to a bulk descriptor at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BulkFlags {
    pub(crate) fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    pub(crate) fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// One registered memory region: a raw pointer and a length. The library
/// never owns this memory.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub ptr: *mut u8,
    pub len: usize,
}

impl Segment {
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }
}

/// A locally registered set of segments. Lives in the class's bulk table
/// under `id` for as long as any strong reference exists; peers address it
/// by that id.
pub(crate) struct LocalBulk {
    pub(crate) id: u64,
    pub(crate) segments: Vec<Segment>,
    pub(crate) flags: BulkFlags,
    pub(crate) size: u64,
    class: Weak<Class>,
}

// SAFETY: the segments are raw views of caller memory. Bulk::create's
// contract requires that memory to stay valid and unaliased for writes while
// the descriptor is registered, which is exactly the window in which the
// progress loop touches it from another thread.
unsafe impl Send for LocalBulk {}
unsafe impl Sync for LocalBulk {}

impl LocalBulk {
    /// Copy `len` bytes starting at the linear offset `offset` out of the
    /// registered segments. Returns `None` when the range is out of bounds.
    pub(crate) fn read_region(&self, offset: u64, len: u64) -> Option<Vec<u8>> {
        // offsets and lengths come off the wire, so the sum may overflow
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return None;
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut skip = offset as usize;
        let mut remaining = len as usize;

        for seg in &self.segments {
            if remaining == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(remaining);
            // SAFETY: seg describes caller memory valid for the lifetime of
            // the registration (see Bulk::create); skip + take <= seg.len.
            let data = unsafe { std::slice::from_raw_parts(seg.ptr.add(skip), take) };
            out.extend_from_slice(data);
            remaining -= take;
            skip = 0;
        }

        Some(out)
    }

    /// Copy `data` into the registered segments starting at the linear
    /// offset `offset`. Returns false when the range is out of bounds.
    pub(crate) fn write_region(&self, offset: u64, data: &[u8]) -> bool {
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > self.size)
        {
            return false;
        }

        let mut skip = offset as usize;
        let mut written = 0usize;

        for seg in &self.segments {
            if written == data.len() {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(data.len() - written);
            // SAFETY: same contract as read_region, and the descriptor was
            // created with a writable flag (checked by the caller).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[written..].as_ptr(),
                    seg.ptr.add(skip),
                    take,
                );
            }
            written += take;
            skip = 0;
        }

        true
    }
}

impl Drop for LocalBulk {
    fn drop(&mut self) {
        if let Some(class) = self.class.upgrade() {
            class.remove_bulk(self.id);
        }
    }
}

/// The remote side of a descriptor received over the wire: the origin's id
/// plus the segment layout, enough to address pulls and pushes.
pub(crate) struct RemoteBulk {
    pub(crate) origin_id: u64,
    pub(crate) size: u64,
    pub(crate) segment_sizes: Vec<u64>,
}

#[derive(Clone)]
enum Repr {
    Local(Arc<LocalBulk>),
    Remote(Arc<RemoteBulk>),
}

/// A reference-counted bulk descriptor. Clones share the underlying
/// registration; the last clone dropping releases it.
#[derive(Clone)]
pub struct Bulk {
    repr: Repr,
}

impl Bulk {
    /// Register `segments` with `class` under a fresh id.
    ///
    /// SAFETY:
    ///
    /// Every segment must point to memory that stays valid until the last
    /// clone of the returned descriptor is dropped, and that memory must not
    /// be read or written in ways that conflict with the permission flag
    /// (the progress thread reads readable descriptors and writes writable
    /// ones while transfers are in flight).
    pub unsafe fn create(
        class: &Arc<Class>,
        segments: Vec<Segment>,
        flags: BulkFlags,
    ) -> Result<Bulk> {
        if segments.is_empty() {
            return Err(Error::InvalidBulk("no segments"));
        }

        let size = segments.iter().map(|s| s.len as u64).sum();
        let id = class.alloc_bulk_id();

        let local = Arc::new(LocalBulk {
            id,
            segments,
            flags,
            size,
            class: Arc::downgrade(class),
        });

        class.insert_bulk(id, Arc::downgrade(&local));

        Ok(Bulk {
            repr: Repr::Local(local),
        })
    }

    /// Total number of bytes covered by the descriptor.
    pub fn size(&self) -> u64 {
        match &self.repr {
            Repr::Local(l) => l.size,
            Repr::Remote(r) => r.size,
        }
    }

    /// Number of registered segments.
    pub fn segment_count(&self) -> u32 {
        match &self.repr {
            Repr::Local(l) => l.segments.len() as u32,
            Repr::Remote(r) => r.segment_sizes.len() as u32,
        }
    }

    pub fn segment_sizes(&self) -> Vec<u64> {
        match &self.repr {
            Repr::Local(l) => l.segments.iter().map(|s| s.len as u64).collect(),
            Repr::Remote(r) => r.segment_sizes.clone(),
        }
    }

    /// Number of live references to the underlying registration.
    pub fn ref_count(&self) -> usize {
        match &self.repr {
            Repr::Local(l) => Arc::strong_count(l),
            Repr::Remote(r) => Arc::strong_count(r),
        }
    }

    /// True for descriptors received over the wire.
    pub fn is_remote(&self) -> bool {
        matches!(self.repr, Repr::Remote(_))
    }

    /// Encode the wire form. Only locally registered descriptors can be
    /// exported; a received descriptor is only meaningful to its origin.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let Repr::Local(local) = &self.repr else {
            return Err(Error::InvalidBulk("cannot re-export a remote descriptor"));
        };

        put_u64(buf, local.id);
        put_u64(buf, local.size);
        put_u32(buf, local.segments.len() as u32);
        for seg in &local.segments {
            put_u64(buf, seg.len as u64);
        }

        Ok(())
    }

    /// Decode the wire form into a remote descriptor.
    pub fn decode(input: &mut &[u8]) -> std::result::Result<Bulk, DecodeError> {
        let mut origin_id = 0u64;
        let mut size = 0u64;
        let mut count = 0u32;

        get_u64(&mut origin_id, input)?;
        get_u64(&mut size, input)?;
        get_u32(&mut count, input)?;

        if count == 0 || size == 0 {
            return Err(DecodeError);
        }

        let mut segment_sizes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut len = 0u64;
            get_u64(&mut len, input)?;
            segment_sizes.push(len);
        }

        if segment_sizes.iter().sum::<u64>() != size {
            return Err(DecodeError);
        }

        Ok(Bulk {
            repr: Repr::Remote(Arc::new(RemoteBulk {
                origin_id,
                size,
                segment_sizes,
            })),
        })
    }

    pub(crate) fn origin_id(&self) -> Option<u64> {
        match &self.repr {
            Repr::Remote(r) => Some(r.origin_id),
            Repr::Local(_) => None,
        }
    }

    pub(crate) fn local(&self) -> Option<&Arc<LocalBulk>> {
        match &self.repr {
            Repr::Local(l) => Some(l),
            Repr::Remote(_) => None,
        }
    }
}
