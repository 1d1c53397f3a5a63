use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
};

use log::{debug, trace};

use crate::{
    block::Block,
    error::{ChunkSizeError, PoolError},
    kernel::{self, DEFAULT_PAGE_SIZE},
    list::{List, Node},
};

/// Pool of fixed size chunks for values of type `T`.
///
/// Memory is requested from the kernel in page aligned blocks of
/// `BLOCK_SIZE` bytes, and every block is split into chunks of the size
/// given to [`FixedPool::new`]. Blocks form a doubly linked chain:
///
/// ```text
///   first block
///  +-----------+        +-----------+        +-----------+
///  |  Block 0  | <----> |  Block 1  | <----> |  Block 2  |
///  +-----------+        +-----------+        +-----------+
///  | free list |        | free list |        | free list |
///  +-----------+        +-----------+        +-----------+
/// ```
///
/// Allocation takes a chunk from the first block with room, appending a new
/// block when every block is full. Releasing a chunk pushes it on top of its
/// block's free list, so the last chunk released is the next one handed out.
/// A block that becomes empty is unmapped right away, except for the first
/// block when it is the only one left; the pool never holds less than one
/// block.
///
/// Dropping the pool unmaps every block but never runs the destructor of
/// values that were not released.
///
/// The pool is not thread safe.
pub struct FixedPool<T, const BLOCK_SIZE: usize> {
    /// Size of every chunk in bytes.
    chunk_size: usize,
    /// Alignment blocks must respect, the system page size.
    block_alignment: usize,
    /// Whether the system reported no page size and we fell back to
    /// [`DEFAULT_PAGE_SIZE`].
    block_alignment_defaulted: bool,
    /// Chain of blocks. Never empty.
    blocks: List<Block>,
    marker: PhantomData<T>,
}

/// Hands a reserved chunk back to the pool unless it is disarmed. Protects
/// the pool when building the value fails or panics.
struct Reservation<'a, T, const BLOCK_SIZE: usize> {
    pool: &'a mut FixedPool<T, BLOCK_SIZE>,
    node: NonNull<Node<Block>>,
    chunk: NonNull<u8>,
}

impl<T, const BLOCK_SIZE: usize> Reservation<'_, T, BLOCK_SIZE> {
    fn into_chunk(self) -> NonNull<u8> {
        let chunk = self.chunk;
        mem::forget(self);
        chunk
    }
}

impl<T, const BLOCK_SIZE: usize> Drop for Reservation<'_, T, BLOCK_SIZE> {
    fn drop(&mut self) {
        // SAFETY: the chunk was reserved from `node` and never held a value.
        unsafe { self.pool.reclaim(self.node, self.chunk) }
    }
}

/// Checks that chunks of `chunk_size` bytes tile a block of `block_size`
/// bytes and can hold both a free list link and a `T`.
fn validate_chunk_size<T>(block_size: usize, chunk_size: usize) -> Result<(), ChunkSizeError> {
    let pointer_size = size_of::<*mut u8>();

    match block_size.checked_rem(chunk_size) {
        Some(0) => {}
        Some(_) => return Err(ChunkSizeError::DoesNotFit { chunk_size, block_size }),
        None => return Err(ChunkSizeError::SmallerThanPointer { chunk_size, minimum: pointer_size }),
    }

    if chunk_size < pointer_size {
        return Err(ChunkSizeError::SmallerThanPointer { chunk_size, minimum: pointer_size });
    }

    if chunk_size < size_of::<T>() {
        return Err(ChunkSizeError::SmallerThanElement { chunk_size, minimum: size_of::<T>() });
    }

    // Blocks are page aligned, so chunk `i` is aligned for `T` as long as
    // every chunk boundary is.
    if chunk_size % align_of::<T>() != 0 {
        return Err(ChunkSizeError::Misaligned { chunk_size, align: align_of::<T>() });
    }

    Ok(())
}

impl<T, const BLOCK_SIZE: usize> FixedPool<T, BLOCK_SIZE> {
    /// Creates a pool whose blocks are split into chunks of `chunk_size`
    /// bytes, and maps its first block.
    ///
    /// # Errors
    ///
    /// - [`PoolError::InvalidChunk`] if `chunk_size` does not divide
    ///   `BLOCK_SIZE`, is smaller than a pointer or a `T`, or is not a
    ///   multiple of the alignment of `T`.
    /// - [`PoolError::InvalidBlock`] if `BLOCK_SIZE` is not a non-zero
    ///   multiple of the page size.
    /// - [`PoolError::OutOfMemory`] if the first block can't be mapped.
    pub fn new(chunk_size: usize) -> Result<Self, PoolError> {
        Self::with_page_size(chunk_size, kernel::page_size())
    }

    /// Same as [`FixedPool::new`] with the page size supplied by the caller.
    /// A page size of zero falls back to [`DEFAULT_PAGE_SIZE`].
    pub(crate) fn with_page_size(chunk_size: usize, page_size: usize) -> Result<Self, PoolError> {
        validate_chunk_size::<T>(BLOCK_SIZE, chunk_size)?;

        let (block_alignment, block_alignment_defaulted) = match page_size {
            0 => (DEFAULT_PAGE_SIZE, true),
            size => (size, false),
        };

        if BLOCK_SIZE == 0 || BLOCK_SIZE % block_alignment != 0 {
            return Err(PoolError::InvalidBlock {
                block_size: BLOCK_SIZE,
                page_size: block_alignment,
            });
        }

        let mut blocks = List::new();
        blocks.append(Block::new(BLOCK_SIZE, chunk_size)?);

        debug!(
            "created pool: block size {}, chunk size {}, alignment {}{}",
            BLOCK_SIZE,
            chunk_size,
            block_alignment,
            if block_alignment_defaulted { " (defaulted)" } else { "" }
        );

        Ok(Self {
            chunk_size,
            block_alignment,
            block_alignment_defaulted,
            blocks,
            marker: PhantomData,
        })
    }

    /// Moves `value` into a free chunk and returns its address.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] if every block is full and a new one
    /// can't be mapped.
    pub fn allocate(&mut self, value: T) -> Result<NonNull<T>, PoolError> {
        self.try_allocate_with(|| Ok::<_, PoolError>(value))
    }

    /// Reserves a chunk and fills it with the value built by `f`.
    ///
    /// If `f` panics, the chunk goes back to the pool before unwinding
    /// continues.
    pub fn allocate_with<F>(&mut self, f: F) -> Result<NonNull<T>, PoolError>
    where
        F: FnOnce() -> T,
    {
        self.try_allocate_with(|| Ok::<_, PoolError>(f()))
    }

    /// Reserves a chunk and fills it with the value built by `f`.
    ///
    /// When `f` fails (or panics) the chunk is handed back exactly like
    /// [`FixedPool::release`] would, minus the destructor: counters are
    /// restored and the chunk is on top of its block's free list again.
    pub fn try_allocate_with<E, F>(&mut self, f: F) -> Result<NonNull<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<PoolError>,
    {
        let (node, chunk) = self.reserve()?;
        let reservation = Reservation { pool: self, node, chunk };

        let value = f()?;

        let slot = reservation.into_chunk().cast::<T>();
        // SAFETY: the chunk is at least `size_of::<T>()` bytes, aligned for
        // `T` and no longer on any free list.
        unsafe { slot.as_ptr().write(value) };

        Ok(slot)
    }

    /// Drops the value at `*ptr`, gives its chunk back to the pool and sets
    /// `*ptr` to `None`. Releasing `None` does nothing.
    ///
    /// # Errors
    ///
    /// [`PoolError::NotOwned`] if the pointer is outside every block. The
    /// pool and `*ptr` are left untouched.
    ///
    /// # Safety
    ///
    /// `*ptr` must have been returned by [`FixedPool::allocate`] (or one of
    /// its variants) on this pool and not released since. No reference to
    /// the value may outlive this call.
    pub unsafe fn release(&mut self, ptr: &mut Option<NonNull<T>>) -> Result<(), PoolError> {
        let Some(value) = *ptr else {
            return Ok(());
        };

        let node = self.owning_block(value.as_ptr() as usize)?;

        // The destructor must run before the chunk is reused for the link.
        if mem::needs_drop::<T>() {
            unsafe { ptr::drop_in_place(value.as_ptr()) };
        }

        unsafe { self.reclaim(node, value.cast()) };
        *ptr = None;

        Ok(())
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn block_alignment(&self) -> usize {
        self.block_alignment
    }

    #[inline]
    pub fn block_alignment_defaulted(&self) -> bool {
        self.block_alignment_defaulted
    }

    /// Number of blocks currently mapped. Always at least one.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().count()
    }

    pub fn available_chunks_in_block(&self, p: NonNull<T>) -> Result<usize, PoolError> {
        Ok(self.block_of(p)?.available_chunks)
    }

    pub fn used_chunks_in_block(&self, p: NonNull<T>) -> Result<usize, PoolError> {
        Ok(self.block_of(p)?.used_chunks)
    }

    pub fn available_space_in_block(&self, p: NonNull<T>) -> Result<usize, PoolError> {
        Ok(self.block_of(p)?.available_space)
    }

    pub fn used_space_in_block(&self, p: NonNull<T>) -> Result<usize, PoolError> {
        Ok(self.block_of(p)?.used_space)
    }

    /// Start address of the block holding `p`, or of the first block when
    /// `p` is `None`.
    pub fn block_address(&self, p: Option<NonNull<T>>) -> Result<NonNull<u8>, PoolError> {
        match p {
            Some(p) => Ok(self.block_of(p)?.begin()),
            None => Ok(self.head().begin()),
        }
    }

    /// Lists the free chunks of the block holding `p` as `(chunk, next)`
    /// pairs, in the order they would be handed out. The last pair has no
    /// `next`; an empty list means the block is full.
    pub fn dump_free_list(&self, p: NonNull<T>) -> Result<Vec<(NonNull<T>, Option<NonNull<T>>)>, PoolError> {
        let block = self.block_of(p)?;

        let mut links = Vec::with_capacity(block.available_chunks);
        links.extend(
            block
                .free_list()
                .links()
                .map(|(chunk, next)| (chunk.cast::<T>(), next.map(NonNull::cast::<T>))),
        );

        Ok(links)
    }

    fn head(&self) -> &Block {
        let head = self.blocks.first().expect("the pool always keeps its first block");
        unsafe { &head.as_ref().data }
    }

    /// Finds the block whose buffer holds `addr`.
    fn owning_block(&self, addr: usize) -> Result<NonNull<Node<Block>>, PoolError> {
        self.blocks
            .nodes()
            .find(|node| unsafe { node.as_ref().data.contains(addr) })
            .ok_or(PoolError::NotOwned { address: addr })
    }

    fn block_of(&self, p: NonNull<T>) -> Result<&Block, PoolError> {
        let node = self.owning_block(p.as_ptr() as usize)?;
        Ok(unsafe { &node.as_ref().data })
    }

    /// Takes a chunk from the first block with room, mapping a new block at
    /// the end of the chain if there is none.
    fn reserve(&mut self) -> Result<(NonNull<Node<Block>>, NonNull<u8>), PoolError> {
        for mut node in self.blocks.nodes() {
            if let Some(chunk) = unsafe { node.as_mut().data.take_chunk() } {
                return Ok((node, chunk));
            }
        }

        let mut node = self.blocks.append(Block::new(BLOCK_SIZE, self.chunk_size)?);
        trace!("pool grew to {} blocks", self.blocks.len());

        let chunk = unsafe { node.as_mut().data.take_chunk() }.expect("a new block has free chunks");

        Ok((node, chunk))
    }

    /// Accounts for `chunk` as free again. A block left with no used chunks
    /// is unmapped unless it is the only block in the pool; otherwise the
    /// chunk goes on top of the block's free list.
    ///
    /// **SAFETY**: `chunk` must be a used chunk of `node` holding no live
    /// value, and `node` must belong to this pool.
    unsafe fn reclaim(&mut self, mut node: NonNull<Node<Block>>, chunk: NonNull<u8>) {
        let block = unsafe { &mut node.as_mut().data };
        block.forget_chunk();

        if block.is_unused() && self.blocks.len() > 1 {
            drop(unsafe { self.blocks.remove(node) });
            trace!("pool shrank to {} blocks", self.blocks.len());
            return;
        }

        unsafe { block.relink_chunk(chunk) };
    }
}

impl<T, const BLOCK_SIZE: usize> Drop for FixedPool<T, BLOCK_SIZE> {
    fn drop(&mut self) {
        debug!("dropping pool with {} blocks", self.blocks.len());
    }
}

impl<T, const BLOCK_SIZE: usize> fmt::Debug for FixedPool<T, BLOCK_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedPool")
            .field("block_size", &BLOCK_SIZE)
            .field("chunk_size", &self.chunk_size)
            .field("block_alignment", &self.block_alignment)
            .field("block_alignment_defaulted", &self.block_alignment_defaulted)
            .field("block_count", &self.block_count())
            .finish()
    }
}

#[cfg(test)]
impl<T, const BLOCK_SIZE: usize> FixedPool<T, BLOCK_SIZE> {
    /// Panics if the chain or any free list is inconsistent.
    pub(crate) fn check_invariants(&self) {
        use std::collections::HashSet;

        let chunks = BLOCK_SIZE / self.chunk_size;
        let nodes: Vec<_> = self.blocks.nodes().take(self.blocks.len() + 1).collect();
        assert_eq!(nodes.len(), self.blocks.len(), "chain longer than its length");
        assert!(!nodes.is_empty(), "pool lost its first block");

        let mut free = HashSet::new();

        for (i, node) in nodes.iter().enumerate() {
            let node = unsafe { node.as_ref() };
            let expected_prev = if i == 0 { None } else { Some(nodes[i - 1]) };
            assert_eq!(node.prev, expected_prev, "block {i} has a broken prev link");
            assert_eq!(node.next, nodes.get(i + 1).copied(), "block {i} has a broken next link");

            let block = &node.data;
            assert_eq!(block.available_chunks + block.used_chunks, chunks);
            assert_eq!(block.available_space + block.used_space, BLOCK_SIZE);
            assert_eq!(block.used_space, block.used_chunks * self.chunk_size);

            let links: Vec<_> = block.free_list().links().take(chunks + 1).collect();
            assert_eq!(links.len(), block.available_chunks, "block {i} free list length");

            for (chunk, _) in links {
                let addr = chunk.as_ptr() as usize;
                assert!(block.contains(addr), "free chunk outside block {i}");
                assert_eq!((addr - block.begin().as_ptr() as usize) % self.chunk_size, 0);
                assert!(free.insert(addr), "chunk {addr:#x} is on two free lists");
            }
        }
    }

    pub(crate) fn used_chunks(&self) -> usize {
        self.blocks.iter().map(|block| block.used_chunks).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::HashSet, panic, rc::Rc};

    use proptest::prelude::*;
    use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;

    const PAGE: usize = 4096;

    fn release<T, const B: usize>(pool: &mut FixedPool<T, B>, p: NonNull<T>) {
        let mut handle = Some(p);
        unsafe { pool.release(&mut handle).unwrap() };
        assert!(handle.is_none());
    }

    #[test]
    fn rejects_chunk_that_does_not_fit() {
        let err = FixedPool::<i32, { size_of::<i32>() * 8 }>::new(5).unwrap_err();
        assert!(matches!(err, PoolError::InvalidChunk(ChunkSizeError::DoesNotFit { .. })));
        assert!(err.to_string().contains("must fit"));
    }

    #[test]
    fn rejects_chunk_smaller_than_pointer() {
        let err = FixedPool::<i32, { size_of::<i32>() * 8 }>::new(2).unwrap_err();
        assert!(err.to_string().contains("at least"));

        let err = FixedPool::<i32, PAGE>::new(0).unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn rejects_block_not_multiple_of_page() {
        let err = FixedPool::<i32, { 4096 + 128 }>::new(8).unwrap_err();
        assert!(matches!(err, PoolError::InvalidBlock { .. }));
        assert!(err.to_string().contains("block"));

        let err = FixedPool::<i32, 0>::new(8).unwrap_err();
        assert!(err.to_string().contains("block"));
    }

    #[test]
    fn rejects_chunk_that_cannot_hold_the_element() {
        let err = FixedPool::<[u64; 4], PAGE>::new(16).unwrap_err();
        assert!(matches!(err, PoolError::InvalidChunk(ChunkSizeError::SmallerThanElement { .. })));
        assert!(err.to_string().contains("at least"));

        let err = FixedPool::<u64, { PAGE * 3 }>::new(12).unwrap_err();
        assert!(matches!(err, PoolError::InvalidChunk(ChunkSizeError::Misaligned { .. })));
    }

    #[test]
    fn block_alignment_follows_page_size() {
        let pool = FixedPool::<i32, PAGE>::new(8).unwrap();
        let page_size = kernel::page_size();

        if page_size == 0 {
            assert_eq!(pool.block_alignment(), DEFAULT_PAGE_SIZE);
            assert!(pool.block_alignment_defaulted());
        } else {
            assert_eq!(pool.block_alignment(), page_size);
            assert!(!pool.block_alignment_defaulted());
        }
        assert_eq!(pool.chunk_size(), 8);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn zero_page_size_falls_back_to_default() {
        let pool = FixedPool::<i32, PAGE>::with_page_size(8, 0).unwrap();
        assert_eq!(pool.block_alignment(), DEFAULT_PAGE_SIZE);
        assert!(pool.block_alignment_defaulted());
    }

    #[test]
    fn foreign_pointer_does_not_belong() {
        let mut pool = FixedPool::<i32, PAGE>::new(8).unwrap();
        let mut local = 7;
        let mut handle = Some(NonNull::from(&mut local));

        let err = unsafe { pool.release(&mut handle) }.unwrap_err();
        assert!(err.to_string().contains("does not belong"));
        assert!(handle.is_some());

        let foreign = NonNull::from(&mut local);
        assert!(pool.available_chunks_in_block(foreign).is_err());
        assert!(pool.dump_free_list(foreign).is_err());
        assert!(pool.block_address(Some(foreign)).is_err());
        pool.check_invariants();
    }

    #[test]
    fn one_past_the_end_does_not_belong() {
        let pool = FixedPool::<u64, PAGE>::new(8).unwrap();
        let begin = pool.block_address(None).unwrap();
        let end = unsafe { begin.add(PAGE) }.cast::<u64>();

        assert!(matches!(pool.used_chunks_in_block(end), Err(PoolError::NotOwned { .. })));
    }

    #[test]
    fn releasing_none_is_a_no_op() {
        let mut pool = FixedPool::<i32, PAGE>::new(8).unwrap();
        let mut handle = None;
        unsafe { pool.release(&mut handle).unwrap() };
        assert!(handle.is_none());
    }

    #[test]
    fn data_integrity_and_release() {
        let mut pool = FixedPool::<i32, PAGE>::new(8).unwrap();
        let mut i0 = Some(pool.allocate(0).unwrap());

        let p = i0.unwrap();
        unsafe { p.as_ptr().write(0x6989aabb_u32 as i32) };

        let i1 = p;
        assert_eq!(unsafe { i1.as_ptr().read() }, 0x6989aabb_u32 as i32);

        unsafe { pool.release(&mut i0).unwrap() };
        assert!(i0.is_none());
    }

    #[test]
    fn values_are_moved_into_their_chunk() {
        #[derive(Debug, PartialEq)]
        struct Args {
            i0: u64,
            i1: u64,
            i2: u64,
            s: String,
        }

        let mut pool = FixedPool::<Args, PAGE>::new(64).unwrap();
        let a0 = pool
            .allocate(Args { i0: 0x45, i1: 0x32, i2: 0x10, s: "test string".into() })
            .unwrap();
        let a1 = pool
            .allocate_with(|| Args { i0: 0x4454, i1: 0x31232, i2: 0x123320, s: "test second string".into() })
            .unwrap();

        assert_ne!(a0, a1);
        unsafe {
            assert_eq!(a0.as_ref().s, "test string");
            assert_eq!((a0.as_ref().i0, a0.as_ref().i1, a0.as_ref().i2), (0x45, 0x32, 0x10));
            assert_eq!(a1.as_ref().s, "test second string");
            assert_eq!((a1.as_ref().i0, a1.as_ref().i1, a1.as_ref().i2), (0x4454, 0x31232, 0x123320));
        }

        release(&mut pool, a0);
        release(&mut pool, a1);
        pool.check_invariants();
    }

    #[test]
    fn block_count_grows_and_shrinks() {
        let mut pool = FixedPool::<u64, PAGE>::new(8).unwrap();
        let mut values: Vec<(NonNull<u64>, u64)> = Vec::new();

        for a in 0..2048u64 {
            let p = pool.allocate(a).unwrap();
            assert_eq!(unsafe { *p.as_ptr() }, a);
            values.push((p, a));

            for (p, v) in &values {
                assert_eq!(unsafe { *p.as_ptr() }, *v, "value overwritten");
            }
        }
        assert_eq!(pool.block_count(), 4);

        for (p, _) in values.drain(..512) {
            release(&mut pool, p);
        }
        assert_eq!(pool.block_count(), 3);

        for (p, v) in &values {
            assert_eq!(unsafe { *p.as_ptr() }, *v, "value overwritten");
        }
        pool.check_invariants();
    }

    #[test]
    fn block_counters_track_allocations() {
        let mut pool = FixedPool::<u64, PAGE>::new(8).unwrap();

        for k in 1..=512usize {
            let p = pool.allocate(k as u64).unwrap();

            assert_eq!(pool.available_chunks_in_block(p).unwrap(), 512 - k);
            assert_eq!(pool.used_chunks_in_block(p).unwrap(), k);
            assert_eq!(pool.available_space_in_block(p).unwrap(), PAGE - 8 * k);
            assert_eq!(pool.used_space_in_block(p).unwrap(), 8 * k);
        }
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn counters_close_after_everything_is_released() {
        let mut pool = FixedPool::<u64, PAGE>::new(64).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let mut live: Vec<_> = (0..300u64).map(|v| pool.allocate(v).unwrap()).collect();
        assert_eq!(pool.block_count(), 5);

        live.shuffle(&mut rng);
        for p in live {
            release(&mut pool, p);
        }

        assert_eq!(pool.block_count(), 1);
        let head = pool.block_address(None).unwrap().cast::<u64>();
        assert_eq!(pool.used_chunks_in_block(head).unwrap(), 0);
        assert_eq!(pool.available_chunks_in_block(head).unwrap(), PAGE / 64);
        assert_eq!(pool.used_space_in_block(head).unwrap(), 0);
        assert_eq!(pool.available_space_in_block(head).unwrap(), PAGE);
        pool.check_invariants();
    }

    #[test]
    fn fresh_block_free_list_is_sequential() {
        const B: usize = PAGE * 5;
        const C: usize = 8;
        const N: usize = B / C;

        let mut pool = FixedPool::<u8, B>::new(C).unwrap();
        let begin = pool.block_address(None).unwrap();
        let addresses: Vec<NonNull<u8>> = (0..N).map(|i| unsafe { begin.add(i * C) }).collect();

        let free_list = pool.dump_free_list(addresses[0]).unwrap();
        assert_eq!(free_list.len(), N);
        for (i, (free, next)) in free_list.iter().enumerate() {
            assert_eq!(*free, addresses[i]);
            assert_eq!(*next, addresses.get(i + 1).copied());
        }

        for expected in &addresses {
            assert_eq!(pool.allocate(0).unwrap(), *expected);
        }
        assert!(pool.dump_free_list(addresses[0]).unwrap().is_empty());
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn single_release_is_reused_first() {
        const B: usize = 20480;
        const C: usize = 8;
        const N: usize = B / C;

        let mut pool = FixedPool::<u8, B>::new(C).unwrap();
        let addresses: Vec<_> = (0..N).map(|_| pool.allocate(0).unwrap()).collect();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..1024 {
            let index = rng.random_range(0..N);
            let released = addresses[index];
            release(&mut pool, released);

            let free_list = pool.dump_free_list(addresses[0]).unwrap();
            assert_eq!(free_list, vec![(released, None)]);

            assert_eq!(pool.allocate(1).unwrap(), released);
        }
        pool.check_invariants();
    }

    #[test]
    fn releases_come_back_in_reverse_order() {
        const C: usize = 512;
        const N: usize = PAGE / C;

        let mut pool = FixedPool::<u8, PAGE>::new(C).unwrap();
        let begin = pool.block_address(None).unwrap();
        let addresses: Vec<NonNull<u8>> = (0..N).map(|i| unsafe { begin.add(i * C) }).collect();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..3 {
            for _ in 0..N {
                pool.allocate(0).unwrap();
            }

            let mut path: Vec<usize> = (0..N).collect();
            path.shuffle(&mut rng);

            for (at, index) in path.iter().enumerate() {
                release(&mut pool, addresses[*index]);
                let free_list = pool.dump_free_list(addresses[0]).unwrap();
                assert_eq!(free_list.len(), at + 1);

                for (k, (free, next)) in free_list.iter().enumerate() {
                    assert_eq!(*free, addresses[path[at - k]]);
                    let expected_next = (k < at).then(|| addresses[path[at - k - 1]]);
                    assert_eq!(*next, expected_next);
                }
            }

            // A lone head block is kept even when it is empty.
            assert_eq!(pool.block_count(), 1);
        }
    }

    #[test]
    fn first_block_is_retained() {
        let mut pool = FixedPool::<usize, PAGE>::new(1024).unwrap();
        let values = [4, 44, 434, 453764, 4537664, 4537661224, 453766124, 45376614, 453764, 4534, 454, 4];
        let p: Vec<_> = values.iter().map(|v| pool.allocate(*v).unwrap()).collect();

        assert_eq!(pool.block_count(), 3);

        for block in p.chunks(4) {
            assert_eq!(pool.available_chunks_in_block(block[0]).unwrap(), 0);
            release(&mut pool, block[1]);
            assert_eq!(pool.available_chunks_in_block(block[2]).unwrap(), 1);
            release(&mut pool, block[3]);
            assert_eq!(pool.available_chunks_in_block(block[2]).unwrap(), 2);
        }

        release(&mut pool, p[8]);
        release(&mut pool, p[10]);
        assert_eq!(pool.block_count(), 2);

        release(&mut pool, p[4]);
        release(&mut pool, p[6]);
        assert_eq!(pool.block_count(), 1);

        release(&mut pool, p[0]);
        release(&mut pool, p[2]);
        assert_eq!(pool.block_count(), 1);

        let head = pool.block_address(None).unwrap().cast::<usize>();
        assert_eq!(pool.available_chunks_in_block(head).unwrap(), 4);
        pool.check_invariants();
    }

    #[test]
    fn emptied_head_hands_over_to_its_successor() {
        let mut pool = FixedPool::<u64, PAGE>::new(2048).unwrap();
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();
        let c = pool.allocate(3).unwrap();
        let old_head = pool.block_address(None).unwrap();
        assert_eq!(pool.block_count(), 2);

        release(&mut pool, a);
        release(&mut pool, b);

        assert_eq!(pool.block_count(), 1);
        assert_ne!(pool.block_address(None).unwrap(), old_head);
        assert_eq!(pool.block_address(Some(c)).unwrap(), pool.block_address(None).unwrap());
        assert_eq!(unsafe { *c.as_ptr() }, 3);
        pool.check_invariants();
    }

    #[test]
    fn release_runs_the_destructor() {
        let tracker = Rc::new(());
        let mut pool = FixedPool::<Rc<()>, PAGE>::new(64).unwrap();

        let a = pool.allocate(Rc::clone(&tracker)).unwrap();
        let b = pool.allocate(Rc::clone(&tracker)).unwrap();
        assert_eq!(Rc::strong_count(&tracker), 3);

        release(&mut pool, a);
        assert_eq!(Rc::strong_count(&tracker), 2);
        release(&mut pool, b);
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn dropping_the_pool_skips_live_destructors() {
        let tracker = Rc::new(());
        {
            let mut pool = FixedPool::<Rc<()>, PAGE>::new(64).unwrap();
            for _ in 0..100 {
                pool.allocate(Rc::clone(&tracker)).unwrap();
            }
            assert_eq!(pool.block_count(), 2);
        }
        assert_eq!(Rc::strong_count(&tracker), 101);
    }

    #[test]
    fn failed_construction_returns_the_chunk() {
        let mut pool = FixedPool::<u64, PAGE>::new(8).unwrap();
        let first = pool.allocate(1).unwrap();
        let head_before = pool.dump_free_list(first).unwrap()[0].0;

        let result: Result<NonNull<u64>, PoolError> =
            pool.try_allocate_with(|| Err(PoolError::OutOfMemory { size: 0 }));
        assert!(result.is_err());

        assert_eq!(pool.used_chunks_in_block(first).unwrap(), 1);
        assert_eq!(pool.available_chunks_in_block(first).unwrap(), 511);
        assert_eq!(pool.dump_free_list(first).unwrap()[0].0, head_before);
        assert_eq!(pool.allocate(2).unwrap(), head_before);
        pool.check_invariants();
    }

    #[test]
    fn failed_construction_in_new_block_unmaps_it() {
        let mut pool = FixedPool::<u64, PAGE>::new(2048).unwrap();
        pool.allocate(1).unwrap();
        pool.allocate(2).unwrap();

        let result: Result<NonNull<u64>, PoolError> =
            pool.try_allocate_with(|| Err(PoolError::OutOfMemory { size: 0 }));
        assert!(result.is_err());
        assert_eq!(pool.block_count(), 1);
        pool.check_invariants();
    }

    #[test]
    fn panicking_constructor_returns_the_chunk() {
        let mut pool = FixedPool::<u64, PAGE>::new(8).unwrap();
        let first = pool.allocate(1).unwrap();

        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            pool.allocate_with(|| panic!("constructor failed")).unwrap();
        }));
        assert!(outcome.is_err());

        assert_eq!(pool.used_chunks_in_block(first).unwrap(), 1);
        pool.check_invariants();
    }

    #[test]
    fn destructor_sees_its_value_before_the_link_is_written() {
        struct Probe<'a> {
            value: u64,
            seen: &'a Cell<u64>,
        }

        impl Drop for Probe<'_> {
            fn drop(&mut self) {
                self.seen.set(self.value);
            }
        }

        let seen = Cell::new(0);
        let mut pool = FixedPool::<Probe<'_>, PAGE>::new(16).unwrap();
        let keep = pool.allocate(Probe { value: 1, seen: &seen }).unwrap();
        let p = pool.allocate(Probe { value: 0xfeed, seen: &seen }).unwrap();

        release(&mut pool, p);
        assert_eq!(seen.get(), 0xfeed);

        release(&mut pool, keep);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn debug_shows_the_configuration() {
        let pool = FixedPool::<u64, PAGE>::new(8).unwrap();
        let text = format!("{pool:?}");

        assert!(text.contains("chunk_size: 8"));
        assert!(text.contains("block_count: 1"));
    }

    proptest! {
        /// Random allocate/release sequences keep every block consistent
        /// and never overwrite live values.
        #[test]
        fn random_ops_keep_invariants(ops in prop::collection::vec((prop::bool::ANY, any::<usize>()), 0..300)) {
            let mut pool = FixedPool::<u64, PAGE>::new(256).unwrap();
            let mut live: Vec<(NonNull<u64>, u64)> = Vec::new();
            let mut next_value = 0u64;

            for (is_allocate, idx) in ops {
                if is_allocate {
                    let p = pool.allocate(next_value).unwrap();
                    prop_assert!(live.iter().all(|(q, _)| *q != p), "chunk handed out twice");
                    live.push((p, next_value));
                    next_value += 1;
                } else if !live.is_empty() {
                    let (p, _) = live.swap_remove(idx % live.len());
                    release(&mut pool, p);
                }

                pool.check_invariants();
                prop_assert_eq!(pool.used_chunks(), live.len());
                for (p, v) in &live {
                    prop_assert_eq!(unsafe { *p.as_ptr() }, *v);
                }
            }

            let addresses: HashSet<_> = live.iter().map(|(p, _)| *p).collect();
            prop_assert_eq!(addresses.len(), live.len());

            for (p, _) in live {
                release(&mut pool, p);
            }
            pool.check_invariants();
            prop_assert_eq!(pool.block_count(), 1);
            prop_assert_eq!(pool.used_chunks(), 0);
        }

        /// The chunk released last is always the next one allocated.
        #[test]
        fn release_then_allocate_reuses_the_chunk(count in 2..64usize, pick in any::<usize>()) {
            let mut pool = FixedPool::<u64, PAGE>::new(64).unwrap();
            let live: Vec<_> = (0..count as u64).map(|v| pool.allocate(v).unwrap()).collect();

            let released = live[pick % count];
            release(&mut pool, released);

            prop_assert_eq!(pool.allocate(0).unwrap(), released);
        }
    }
}
