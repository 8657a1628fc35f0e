// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::AccessMode;

/// A non-owning view of a memory region that may be registered for
/// one-sided transfers. Cheap to copy; the caller keeps the underlying
/// memory alive and accessible for as long as any exposure built from this
/// buffer exists.
#[derive(Debug, Clone, Copy)]
pub struct MutableBuffer {
    data: *mut u8,
    size: usize,
}

// SAFETY: a MutableBuffer is an inert (pointer, length) pair; the validity
// contract is on the code that dereferences it (the transfer paths, which
// hold the exposure alive).
unsafe impl Send for MutableBuffer {}
unsafe impl Sync for MutableBuffer {}

impl MutableBuffer {
    pub fn new(data: *mut u8, size: usize) -> Self {
        Self { data, size }
    }

    /// Returns a pointer to the beginning of the memory region.
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    /// Returns the size of the memory region.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn page_protections(mode: AccessMode) -> libc::c_int {
    match mode {
        AccessMode::ReadOnly => libc::PROT_READ,
        AccessMode::WriteOnly => libc::PROT_WRITE,
        AccessMode::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

/// A file mapped into memory. Exclusively owns its mapping and unmaps it on
/// drop.
#[derive(Debug)]
pub struct MappedBuffer {
    data: *mut u8,
    size: usize,
    mode: AccessMode,
}

// SAFETY: the mapping is exclusively owned and lives until drop.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Map the whole of the file at `pathname` with the page protections
    /// implied by `mode`.
    pub fn open<P: AsRef<Path>>(pathname: P, mode: AccessMode) -> io::Result<MappedBuffer> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(mode != AccessMode::ReadOnly)
            .open(pathname)?;

        let size = file.metadata()?.len() as usize;

        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: fd is a valid open file of `size` bytes; a MAP_FAILED
        // result is checked below.
        let data = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                page_protections(mode),
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if data == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(MappedBuffer {
            data: data as *mut u8,
            size,
            mode,
        })
    }

    /// Returns a pointer to the beginning of the mapping.
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    /// Returns the size of the mapping.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    /// A non-owning view of the mapping, suitable for exposure.
    pub fn as_buffer(&self) -> MutableBuffer {
        MutableBuffer::new(self.data, self.size)
    }

    /// Change the page protections of the mapping.
    pub fn protect(&mut self, mode: AccessMode) -> io::Result<()> {
        // SAFETY: (data, size) describe the live mapping owned by self.
        let rv = unsafe { libc::mprotect(self.data as *mut libc::c_void, self.size, page_protections(mode)) };

        if rv != 0 {
            return Err(io::Error::last_os_error());
        }

        self.mode = mode;
        Ok(())
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: (data, size) describe the live mapping owned by self;
        // nothing uses it after this point.
        let rv = unsafe { libc::munmap(self.data as *mut libc::c_void, self.size) };

        if rv != 0 {
            // can't propagate from drop
            error!(
                "munmap({:p}, {}) failed: {}",
                self.data,
                self.size,
                io::Error::last_os_error()
            );
        }
    }
}
