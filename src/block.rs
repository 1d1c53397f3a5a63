use std::ptr::NonNull;

use log::trace;

use crate::{error::PoolError, freelist::FreeList, kernel};

/// One page aligned buffer carved into equally sized chunks.
///
/// The block is always stored inside a [`crate::list::Node`], which carries
/// the links to its neighbours in the pool's chain. The diagram ignores that
/// wrapper:
///
/// ```text
/// +---------------------+
/// |   begin, size       | ----------+
/// +---------------------+           |
/// |   chunk counters    |           v
/// +---------------------+     +-------+-------+-------+-----+-------+
/// |   free list head    | --> | chunk | chunk | chunk | ... | chunk |
/// +---------------------+     +-------+-------+-------+-----+-------+
///                             ^ begin                          end ^
/// ```
///
/// The counters always satisfy `available_chunks + used_chunks == size / chunk_size`
/// and `available_space + used_space == size`.
pub(crate) struct Block {
    /// Start of the buffer returned by the kernel.
    begin: NonNull<u8>,
    /// Size of the buffer in bytes.
    size: usize,
    /// Size of every chunk in bytes.
    chunk_size: usize,
    pub available_chunks: usize,
    pub used_chunks: usize,
    pub available_space: usize,
    pub used_space: usize,
    /// Free chunks of this block.
    free_list: FreeList,
}

impl Block {
    /// Requests a new buffer of `size` bytes from the kernel and threads all
    /// of its chunks into the free list.
    ///
    /// `chunk_size` must divide `size` and be at least pointer sized.
    pub fn new(size: usize, chunk_size: usize) -> Result<Self, PoolError> {
        debug_assert!(chunk_size >= size_of::<*mut u8>());
        debug_assert_eq!(size % chunk_size, 0);

        let begin = unsafe { kernel::request_memory(size) }.ok_or(PoolError::OutOfMemory { size })?;
        let chunks = size / chunk_size;

        // The kernel hands out zeroed pages, so only the links need writing.
        let free_list = unsafe { FreeList::thread(begin, chunk_size, chunks) };

        trace!("mapped block at {:p} ({} bytes, {} chunks)", begin, size, chunks);

        Ok(Self {
            begin,
            size,
            chunk_size,
            available_chunks: chunks,
            used_chunks: 0,
            available_space: size,
            used_space: 0,
            free_list,
        })
    }

    #[inline]
    pub fn begin(&self) -> NonNull<u8> {
        self.begin
    }

    /// One past the last byte of the buffer.
    #[inline]
    pub fn end(&self) -> usize {
        self.begin.as_ptr() as usize + self.size
    }

    /// Tells whether `addr` lies in `[begin, end)`.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.begin.as_ptr() as usize..self.end()).contains(&addr)
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.used_chunks == 0
    }

    #[inline]
    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Takes the next free chunk and accounts for it as used.
    pub fn take_chunk(&mut self) -> Option<NonNull<u8>> {
        // SAFETY: chunks only reach the free list through `thread` and
        // `relink_chunk`, both of which leave them free.
        let chunk = unsafe { self.free_list.pop() }?;

        self.used_chunks += 1;
        self.available_chunks -= 1;
        self.used_space += self.chunk_size;
        self.available_space -= self.chunk_size;

        Some(chunk)
    }

    /// Accounts for `chunk` being free again without touching its bytes.
    /// Used on its own when the whole block is about to be unmapped.
    pub fn forget_chunk(&mut self) {
        self.used_chunks -= 1;
        self.available_chunks += 1;
        self.used_space -= self.chunk_size;
        self.available_space += self.chunk_size;
    }

    /// Pushes an already accounted `chunk` on top of the free list.
    ///
    /// **SAFETY**: `chunk` must belong to this block, be out of the free list
    /// and hold no live value.
    pub unsafe fn relink_chunk(&mut self, chunk: NonNull<u8>) {
        debug_assert!(self.contains(chunk.as_ptr() as usize));
        unsafe { self.free_list.push(chunk) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        trace!("unmapping block at {:p}", self.begin);
        // SAFETY: `begin` and `size` come straight from `request_memory`
        // and the block is the only owner of the buffer.
        unsafe { kernel::return_memory(self.begin, self.size) }
    }
}
