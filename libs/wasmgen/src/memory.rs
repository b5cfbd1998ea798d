// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;

use crate::types::MemoryType;
use crate::{Result, WASM_PAGE_SIZE};

/// Largest number of pages a 32-bit linear memory can have.
const MAX_PAGES: u32 = 65_536;

/// A WebAssembly linear memory.
///
/// Cloning a `Memory` yields another handle to the same memory, which is how
/// memories are shared between the embedder and instances.
#[derive(Clone)]
pub struct Memory(Arc<spin::Mutex<MemoryInner>>);

struct MemoryInner {
    bytes: Vec<u8>,
    ty: MemoryType,
}

/// Error for out of bounds [`Memory`] access.
#[derive(Debug)]
#[non_exhaustive]
pub struct MemoryAccessError {
    // Keep struct internals private for future extensibility.
    _private: (),
}

// ===== impl Memory =====

impl Memory {
    /// Allocates a zeroed memory of `ty.initial` pages.
    ///
    /// # Errors
    ///
    /// Fails if the memory cannot be allocated.
    pub fn new(ty: MemoryType) -> Result<Self> {
        let len = pages_to_bytes(ty.initial);
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(Self(Arc::new(spin::Mutex::new(MemoryInner { bytes, ty }))))
    }

    pub fn same(lhs: &Memory, rhs: &Memory) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub fn ty(&self) -> MemoryType {
        self.0.lock().ty
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 {
        // memories never exceed 2^16 pages
        (self.0.lock().bytes.len() / WASM_PAGE_SIZE as usize) as u32
    }

    /// Current size in bytes.
    pub fn data_size(&self) -> usize {
        self.0.lock().bytes.len()
    }

    /// Grows the memory by `delta` pages and returns the previous size, or
    /// `None` if the maximum would be exceeded or the allocation failed.
    pub fn grow(&self, delta: u32) -> Option<u32> {
        let mut inner = self.0.lock();
        let old = (inner.bytes.len() / WASM_PAGE_SIZE as usize) as u32;
        let new = old.checked_add(delta)?;
        if new > inner.ty.maximum.unwrap_or(MAX_PAGES).min(MAX_PAGES) {
            return None;
        }

        let len = pages_to_bytes(new);
        let additional = len - inner.bytes.len();
        inner.bytes.try_reserve_exact(additional).ok()?;
        inner.bytes.resize(len, 0);
        tracing::trace!("memory grown from {old} to {new} pages");
        Some(old)
    }

    /// Copies `buffer.len()` bytes starting at `offset` out of the memory.
    ///
    /// # Errors
    ///
    /// Fails if the range is out of bounds, in which case `buffer` is unchanged.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), MemoryAccessError> {
        let inner = self.0.lock();
        let src = offset
            .checked_add(buffer.len())
            .and_then(|end| inner.bytes.get(offset..end))
            .ok_or(MemoryAccessError { _private: () })?;
        buffer.copy_from_slice(src);
        Ok(())
    }

    /// Copies `buffer` into the memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the range is out of bounds, in which case the memory is unchanged.
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result<(), MemoryAccessError> {
        let mut inner = self.0.lock();
        let dst = offset
            .checked_add(buffer.len())
            .and_then(|end| inner.bytes.get_mut(offset..end))
            .ok_or(MemoryAccessError { _private: () })?;
        dst.copy_from_slice(buffer);
        Ok(())
    }

    /// Reads `N` bytes at the effective address `addr`.
    pub(crate) fn load<const N: usize>(&self, addr: u64) -> Option<[u8; N]> {
        let start = usize::try_from(addr).ok()?;
        let inner = self.0.lock();
        let bytes = inner.bytes.get(start..start.checked_add(N)?)?;
        <[u8; N]>::try_from(bytes).ok()
    }

    /// Writes `bytes` at the effective address `addr`, returning `false` if out of bounds.
    pub(crate) fn store(&self, addr: u64, bytes: &[u8]) -> bool {
        let Ok(start) = usize::try_from(addr) else {
            return false;
        };
        let mut inner = self.0.lock();
        match start
            .checked_add(bytes.len())
            .and_then(|end| inner.bytes.get_mut(start..end))
        {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}

fn pages_to_bytes(pages: u32) -> usize {
    pages as usize * WASM_PAGE_SIZE as usize
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.lock();
        f.debug_struct("Memory")
            .field("ty", &inner.ty)
            .field("len", &inner.bytes.len())
            .finish_non_exhaustive()
    }
}

// ===== impl MemoryAccessError =====

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of bounds memory access")
    }
}

impl core::error::Error for MemoryAccessError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(initial: u32, maximum: Option<u32>) -> Memory {
        Memory::new(MemoryType { initial, maximum }).unwrap()
    }

    #[test]
    fn grow_respects_maximum() {
        let mem = memory(1, Some(3));
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.grow(2), None);
        assert_eq!(mem.grow(0), Some(2));
        assert_eq!(mem.data_size(), 2 * WASM_PAGE_SIZE as usize);
    }

    #[test]
    fn accesses_are_bounds_checked() {
        let mem = memory(1, None);
        let end = WASM_PAGE_SIZE as usize;
        mem.write(end - 4, &[1, 2, 3, 4]).unwrap();
        assert!(mem.write(end - 3, &[1, 2, 3, 4]).is_err());
        assert!(mem.write(usize::MAX, &[1]).is_err());

        let mut buf = [0; 4];
        mem.read(end - 4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mem.load::<2>(end as u64 - 2), Some([3, 4]));
        assert_eq!(mem.load::<2>(end as u64 - 1), None);
        assert!(!mem.store(u64::MAX, &[0]));
    }

    #[test]
    fn clones_share_contents() {
        let mem = memory(1, None);
        let other = mem.clone();
        assert!(mem.store(8, &[42]));
        assert_eq!(other.load::<1>(8), Some([42]));
        assert!(Memory::same(&mem, &other));
    }
}
