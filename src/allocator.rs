use std::ptr::NonNull;

use crate::{error::PoolError, pool::FixedPool};

/// Allocator facade over a [`FixedPool`], for code that only needs to
/// allocate and deallocate values and never inspects the blocks.
pub struct FixedAllocator<T, const BLOCK_SIZE: usize> {
    pool: FixedPool<T, BLOCK_SIZE>,
}

impl<T, const BLOCK_SIZE: usize> FixedAllocator<T, BLOCK_SIZE> {
    /// See [`FixedPool::new`].
    pub fn new(chunk_size: usize) -> Result<Self, PoolError> {
        Ok(Self {
            pool: FixedPool::new(chunk_size)?,
        })
    }

    /// See [`FixedPool::allocate`].
    #[inline]
    pub fn allocate(&mut self, value: T) -> Result<NonNull<T>, PoolError> {
        self.pool.allocate(value)
    }

    /// See [`FixedPool::release`].
    ///
    /// # Safety
    ///
    /// Same contract as [`FixedPool::release`].
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: &mut Option<NonNull<T>>) -> Result<(), PoolError> {
        unsafe { self.pool.release(ptr) }
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.pool.chunk_size()
    }
}
