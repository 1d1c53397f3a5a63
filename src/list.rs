use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list that owns its nodes.
///
/// Unlike the data it links together, each node lives on the heap on its
/// own, so a node address stays valid until that node is removed. Callers
/// hold on to [`NonNull<Node<T>>`] handles and hand them back to
/// [`List::remove`].
///
/// ```text
///          head                                   tail
///           |                                      |
///       +---v---+  next  +-------+  next  +-------v+
/// None <| Node  |------->| Node  |------->| Node   |> None
///       |       |<-------|       |<-------|        |
///       +-------+  prev  +-------+  prev  +--------+
/// ```
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<Box<Node<T>>>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

/// Iterator over the node handles of a [`List`].
pub(crate) struct Nodes<'a, T> {
    current: Link<Node<T>>,
    marker: PhantomData<&'a Node<T>>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    /// Appends `data` to the end of the list and returns the handle of the
    /// node that now holds it.
    pub fn append(&mut self, data: T) -> NonNull<Node<T>> {
        let node = NonNull::from(Box::leak(Box::new(Node {
            next: None,
            prev: self.tail,
            data,
        })));

        unsafe {
            if let Some(mut tail) = self.tail {
                tail.as_mut().next = Some(node);
            } else {
                self.head = Some(node);
            }
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node` from the list and gives back its element.
    ///
    /// If `node` was the head, its successor is promoted to head and its
    /// `prev` link is cleared.
    ///
    /// **SAFETY**: `node` must be a handle returned by [`List::append`] on
    /// this same list that has not been removed yet.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) -> T {
        unsafe {
            let Node { next, prev, data } = *Box::from_raw(node.as_ptr());

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }

            self.len -= 1;

            data
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }

    /// Walks the list handing out node pointers instead of references, for
    /// callers that need to mutate the node afterwards.
    pub fn nodes(&self) -> Nodes<'_, T> {
        Nodes {
            current: self.head,
            marker: PhantomData,
        }
    }
}

impl<T> Drop for List<T> {
    fn drop(&mut self) {
        while let Some(head) = self.head {
            unsafe {
                drop(self.remove(head));
            }
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;

            Some(&node.as_ref().data)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> Iterator for Nodes<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }

        Some(node)
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
