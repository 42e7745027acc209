use std::collections::BTreeMap;
use std::mem;
use std::ops::Bound;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::runtime::Runtime;

/// First-fit, coalescing byte-offset planner.
///
/// Offsets are handed out of an abstract free region starting at 0 long
/// before any real memory exists; `get_ptr` materializes a single buffer of
/// `peak` bytes through the runtime once planning is done. Blocks freed
/// during planning are kept in an ordered map keyed by offset; space past
/// `frontier` (the highest offset ever carved) is an implicit tail block.
/// Adjacent free entries are always coalesced.
pub struct Allocator {
    runtime: Arc<dyn Runtime>,
    used: usize,
    peak: usize,
    // Length of the widest scalar a tensor can carry.
    alignment: usize,
    free_blocks: BTreeMap<usize, usize>,
    frontier: usize,
    capacity: Option<usize>,
    ptr: Option<NonNull<u8>>,
}

impl Allocator {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            used: 0,
            peak: 0,
            alignment: mem::size_of::<u64>(),
            free_blocks: BTreeMap::new(),
            frontier: 0,
            capacity: None,
            ptr: None,
        }
    }

    /// Bounds the planned region to `capacity` bytes; requests that do not
    /// fit fail with `OutOfBudget`.
    pub fn with_capacity(runtime: Arc<dyn Runtime>, capacity: usize) -> Self {
        let mut allocator = Self::new(runtime);
        allocator.capacity = Some(capacity);
        allocator
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Free blocks carved out so far, keyed by offset.
    pub fn free_blocks(&self) -> &BTreeMap<usize, usize> {
        &self.free_blocks
    }

    /// End of the highest offset ever handed out.
    pub fn frontier(&self) -> usize {
        self.frontier
    }

    pub fn is_materialized(&self) -> bool {
        self.ptr.is_some()
    }

    /// Plans `size` bytes and returns the chosen byte offset.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        if self.ptr.is_some() {
            return Err(GraphError::InvalidState(
                "alloc after the real buffer was materialized",
            ));
        }
        let size = self.aligned_size(size);

        // First fit in offset order. A block ending at the frontier borders
        // the implicit tail, so it can satisfy any size by extending.
        let mut placement = None;
        for (&offset, &block_size) in &self.free_blocks {
            if block_size >= size || offset + block_size == self.frontier {
                placement = Some((offset, block_size));
                break;
            }
        }

        let offset = match placement {
            Some((offset, block_size)) if block_size >= size => {
                self.free_blocks.remove(&offset);
                if block_size > size {
                    self.free_blocks.insert(offset + size, block_size - size);
                }
                offset
            }
            Some((offset, _)) => {
                let end = self.fits(offset, size)?;
                self.free_blocks.remove(&offset);
                self.frontier = end;
                offset
            }
            None => {
                let offset = self.frontier;
                let end = self.fits(offset, size)?;
                self.frontier = end;
                offset
            }
        };

        self.used += size;
        self.peak = self.peak.max(self.used);
        Ok(offset)
    }

    /// Returns a planned range to the free list, coalescing with adjacent
    /// blocks.
    pub fn free(&mut self, offset: usize, size: usize) -> Result<()> {
        if self.ptr.is_some() {
            return Err(GraphError::InvalidState(
                "free after the real buffer was materialized",
            ));
        }
        let mut offset = offset;
        let mut size = self.aligned_size(size);
        self.used = self.used.saturating_sub(size);

        if let Some((&prev_offset, &prev_size)) = self.free_blocks.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free_blocks.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some((&next_offset, &next_size)) = self
            .free_blocks
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next()
        {
            if offset + size == next_offset {
                self.free_blocks.remove(&next_offset);
                size += next_size;
            }
        }
        self.free_blocks.insert(offset, size);
        Ok(())
    }

    /// Materializes the backing buffer on first call; immutable afterwards.
    /// Planning (`alloc`/`free`) is forbidden once this returns.
    pub fn get_ptr(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.ptr {
            return Ok(ptr);
        }
        let ptr = self.runtime.alloc(self.peak)?;
        println!("Allocator really alloc: {:p} {} bytes", ptr.as_ptr(), self.peak);
        self.ptr = Some(ptr);
        Ok(ptr)
    }

    /// Prints the memory accounting line.
    pub fn info(&self) {
        println!("Used memory: {}, peak memory: {}", self.used, self.peak);
    }

    /// Rounds `bytes` up to a multiple of the alignment.
    pub fn aligned_size(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.alignment).saturating_mul(self.alignment)
    }

    fn fits(&self, offset: usize, size: usize) -> Result<usize> {
        let end = offset
            .checked_add(size)
            .ok_or(GraphError::OutOfBudget { requested: size })?;
        match self.capacity {
            Some(capacity) if end > capacity => {
                Err(GraphError::OutOfBudget { requested: size })
            }
            _ => Ok(end),
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            self.runtime.dealloc(ptr);
        }
    }
}
