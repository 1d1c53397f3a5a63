//! Fixed size object pool.
//!
//! A [`FixedPool<T, BLOCK_SIZE>`] requests page aligned blocks of
//! `BLOCK_SIZE` bytes from the kernel (`mmap` on unix, `VirtualAlloc` on
//! Windows) and splits each of them into chunks of a size chosen at runtime.
//! Free chunks of a block are threaded into an intrusive linked list: the
//! first bytes of every free chunk store the address of the next one.
//!
//! ```text
//! +-----------------------------------+      +-----------------------------------+
//! | Block | used | free | used | free | <--> | Block | free | free | free | free |
//! +-----------------|-------------^---+      +---------|------^------|------^----+
//!                   +-------------+                    +------+      +------+
//! ```
//!
//! Allocating takes the first free chunk of the first block with room;
//! releasing puts the chunk back on top of its block's list. Blocks are
//! mapped when every block is full and unmapped as soon as they empty, but
//! the pool always keeps at least one block.
//!
//! ```rust
//! use fixpool::FixedPool;
//!
//! let mut pool = FixedPool::<u64, 4096>::new(8)?;
//!
//! let value = pool.allocate(42)?;
//! assert_eq!(unsafe { *value.as_ptr() }, 42);
//!
//! let mut handle = Some(value);
//! unsafe { pool.release(&mut handle)? };
//! assert!(handle.is_none());
//! # Ok::<(), fixpool::PoolError>(())
//! ```
//!
//! The pool is single threaded and hands out raw pointers; keeping track of
//! which values are still alive is up to the caller.

mod allocator;
mod block;
mod error;
mod freelist;
mod kernel;
mod list;
mod pool;

pub use allocator::FixedAllocator;
pub use error::{ChunkSizeError, PoolError};
pub use pool::FixedPool;
