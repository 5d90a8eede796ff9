//! Fixed-size per-connection transfer buffers.
//!
//! Each connection owns one read buffer and one write buffer, allocated once
//! when the connection is created and reused for its whole life. Capacity
//! never changes, so the storage address stays stable while the kernel
//! holds a pointer to it during a completion-model transfer.

use crate::error::{Error, Result};

/// Default capacity of a transfer buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A heap buffer of fixed capacity.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
}

impl Buffer {
    /// Create a zeroed buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    /// The first `len` bytes, clamped to capacity.
    pub fn prefix(&self, len: usize) -> &[u8] {
        &self.data[..len.min(self.data.len())]
    }

    /// Copy `src` into the start of the buffer.
    ///
    /// Payloads larger than the capacity are rejected and leave the buffer
    /// untouched.
    pub fn fill(&mut self, src: &[u8]) -> Result<usize> {
        if src.len() > self.data.len() {
            return Err(Error::PayloadTooLarge {
                len: src.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    /// Zero the first `len` bytes, clamped to capacity.
    pub fn clear_prefix(&mut self, len: usize) {
        let len = len.min(self.data.len());
        self.data[..len].fill(0);
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Give up the storage without freeing it.
    ///
    /// Used when the kernel may still own a transfer into this memory.
    /// Afterwards the buffer has zero capacity.
    pub fn leak(&mut self) {
        std::mem::forget(std::mem::take(&mut self.data));
    }
}
