//! Block-allocating object pools with a shared memory budget.
//!
//! Fixed-size records (segments, tree-map nodes, overlap-count entries)
//! are handed out as `u32` indices into block storage. Freed indices go
//! on a per-pool free list and are reused before any new block is
//! charged against the budget.

use crate::error::{Error, Result};

/// Byte budget shared by every pool of one simulator instance.
#[derive(Debug, Clone)]
pub struct MemoryGauge {
    limit: usize,
    used: usize,
    peak: usize,
}

impl MemoryGauge {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0, peak: 0 }
    }

    /// Reserve `bytes` against the budget, or fail without side effects.
    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        let used = self.used.checked_add(bytes).ok_or(Error::NoMemory)?;
        if used > self.limit {
            return Err(Error::MaxMemoryExceeded { limit: self.limit });
        }
        self.used = used;
        self.peak = self.peak.max(used);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }
}

#[derive(Debug)]
pub struct Pool<T> {
    blocks: Vec<Box<[T]>>,
    free: Vec<u32>,
    block_size: usize,
    live: usize,
    peak_live: usize,
}

impl<T: Default + Clone> Pool<T> {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            block_size: block_size.max(1),
            live: 0,
            peak_live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// Live object count.
    pub fn live(&self) -> usize {
        self.live
    }

    /// High-water mark of live objects.
    pub fn peak_live(&self) -> usize {
        self.peak_live
    }

    fn add_block(&mut self, gauge: &mut MemoryGauge) -> Result<()> {
        let bytes = self
            .block_size
            .checked_mul(size_of::<T>())
            .ok_or(Error::NoMemory)?;
        gauge.charge(bytes)?;
        let base = self.capacity() as u32;
        self.blocks
            .push(vec![T::default(); self.block_size].into_boxed_slice());
        // Newest slots are popped first; order within a block is arbitrary.
        for offset in (0..self.block_size as u32).rev() {
            self.free.push(base + offset);
        }
        Ok(())
    }

    /// Guarantee that `count` allocations will succeed without touching
    /// the budget again. Called before an event mutates any state, so a
    /// budget failure leaves the simulation resumable.
    pub fn ensure_free(&mut self, count: usize, gauge: &mut MemoryGauge) -> Result<()> {
        while self.free.len() < count {
            self.add_block(gauge)?;
        }
        Ok(())
    }

    pub fn alloc(&mut self, gauge: &mut MemoryGauge) -> Result<u32> {
        if self.free.is_empty() {
            self.add_block(gauge)?;
        }
        let index = self.free.pop().expect("free list refilled");
        self.live += 1;
        self.peak_live = self.peak_live.max(self.live);
        Ok(index)
    }

    pub fn free(&mut self, index: u32) {
        debug_assert!((index as usize) < self.capacity());
        self.get_mut(index).clone_from(&T::default());
        self.free.push(index);
        self.live -= 1;
    }

    pub fn get(&self, index: u32) -> &T {
        let i = index as usize;
        &self.blocks[i / self.block_size][i % self.block_size]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut T {
        let i = index as usize;
        &mut self.blocks[i / self.block_size][i % self.block_size]
    }
}
