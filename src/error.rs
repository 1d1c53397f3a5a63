use thiserror::Error;

/// Errors reported by [`crate::FixedPool`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The chunk size can't be used with this block size or element type.
    #[error("invalid chunk size: {0}")]
    InvalidChunk(#[from] ChunkSizeError),

    /// The block size is not a whole number of pages.
    #[error("block size {block_size} must be a non-zero multiple of the system minimum page size ({page_size})")]
    InvalidBlock {
        block_size: usize,
        page_size: usize,
    },

    /// The pointer is outside every block of the pool.
    #[error("address {address:#x} does not belong to the pool")]
    NotOwned { address: usize },

    /// The system refused to map a new block.
    #[error("out of memory: could not map a {size} byte block")]
    OutOfMemory { size: usize },
}

/// Why a chunk size was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkSizeError {
    #[error("chunk size {chunk_size} must fit in the block size {block_size}")]
    DoesNotFit { chunk_size: usize, block_size: usize },

    #[error("chunk size {chunk_size} must be at least the size of a pointer ({minimum})")]
    SmallerThanPointer { chunk_size: usize, minimum: usize },

    #[error("chunk size {chunk_size} must be at least the size of the element ({minimum})")]
    SmallerThanElement { chunk_size: usize, minimum: usize },

    #[error("chunk size {chunk_size} must be a multiple of the element alignment ({align})")]
    Misaligned { chunk_size: usize, align: usize },
}
