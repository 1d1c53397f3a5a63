use std::{iter::FusedIterator, ptr::{self, NonNull}};

/// Intrusive singly linked list of the free chunks of one block.
///
/// The list doesn't own any storage. Every free chunk stores the address of
/// the next free chunk in its first pointer-sized bytes, and the list only
/// keeps the address of the first one:
///
/// ```text
///  head
///   |
///   v
/// +------+------+------+------+------+------+
/// | next | used | next | used | used | null |   <- one block, six chunks
/// +--|---+------+--|---+------+------+------+
///    |             ^  |                 ^
///    +-------------+  +-----------------+
/// ```
///
/// Chunks are only required to be pointer sized, not pointer aligned, so the
/// links are always read and written unaligned.
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
}

/// Walks a [`FreeList`] yielding `(chunk, next)` pairs.
pub(crate) struct Links<'a> {
    current: Option<NonNull<u8>>,
    marker: std::marker::PhantomData<&'a FreeList>,
}

#[inline]
unsafe fn read_link(chunk: NonNull<u8>) -> Option<NonNull<u8>> {
    unsafe { NonNull::new(ptr::read_unaligned(chunk.as_ptr().cast::<*mut u8>())) }
}

#[inline]
unsafe fn write_link(chunk: NonNull<u8>, next: Option<NonNull<u8>>) {
    let next = next.map_or(ptr::null_mut(), NonNull::as_ptr);
    unsafe { ptr::write_unaligned(chunk.as_ptr().cast::<*mut u8>(), next) }
}

impl FreeList {
    /// Creates a list with no free chunks.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Threads `count` consecutive chunks of `chunk_size` bytes starting at
    /// `begin`: chunk `i` links to chunk `i + 1` and the last one to null.
    ///
    /// A freshly threaded list hands chunks out in ascending address order.
    ///
    /// **SAFETY**: `begin` must be valid for writes of `count * chunk_size`
    /// bytes and `chunk_size` must be at least the size of a pointer.
    pub unsafe fn thread(begin: NonNull<u8>, chunk_size: usize, count: usize) -> Self {
        if count == 0 {
            return Self::new();
        }

        unsafe {
            for i in 0..count - 1 {
                let chunk = begin.add(i * chunk_size);
                write_link(chunk, Some(begin.add((i + 1) * chunk_size)));
            }

            write_link(begin.add((count - 1) * chunk_size), None);
        }

        Self { head: Some(begin) }
    }

    /// Takes the first free chunk. The link stored inside it is read before
    /// the chunk is handed out, so the caller is free to overwrite it.
    ///
    /// **SAFETY**: every chunk on the list must still be free.
    pub unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
        let chunk = self.head?;
        self.head = unsafe { read_link(chunk) };

        Some(chunk)
    }

    /// Puts `chunk` back at the front of the list, making it the next chunk
    /// [`FreeList::pop`] returns.
    ///
    /// **SAFETY**: `chunk` must be a chunk of the same block that is not on
    /// the list already, and whatever lived in it must be dead.
    pub unsafe fn push(&mut self, chunk: NonNull<u8>) {
        unsafe { write_link(chunk, self.head) };
        self.head = Some(chunk);
    }

    /// Iterates the free chunks from head to tail.
    pub fn links(&self) -> Links<'_> {
        Links {
            current: self.head,
            marker: std::marker::PhantomData,
        }
    }
}

impl Iterator for Links<'_> {
    type Item = (NonNull<u8>, Option<NonNull<u8>>);

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.current?;
        let next = unsafe { read_link(chunk) };
        self.current = next;

        Some((chunk, next))
    }
}

impl FusedIterator for Links<'_> {}
