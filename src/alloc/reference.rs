//! `ReferenceAllocator<T>` delegates ref-counting to the object itself:
//! `T` is a heap-persisted structure (a `SortedMap`/`SortedSet`, most
//! commonly) that already carries its own ref count and offset.
//! `deref` needs a caller-supplied constructor rather than reflection,
//! since a raw offset alone cannot tell this crate which concrete `T`
//! to rebuild — the allocator's builder passes that in once, up front.

use std::io::{Read, Seek, Write};
use std::marker::PhantomData;

use super::Allocator;
use crate::error::Result;
use crate::heap::Heap;

/// A heap-persisted object that manages its own reference count.
pub trait Counted<S> {
    fn offset(&self) -> u64;
    fn incr_ref(&self, heap: &Heap<S>) -> Result<u32>;
    fn decr_ref(&self, heap: &Heap<S>) -> Result<u32>;
    /// Called once the ref count reaches zero; frees this object's own
    /// backing blocks (and, transitively, anything it alone owns).
    fn teardown(self, heap: &Heap<S>) -> Result<()>;
}

pub struct ReferenceAllocator<'h, S, T> {
    heap: &'h Heap<S>,
    construct: Box<dyn Fn(&'h Heap<S>, u64) -> T + 'h>,
    _t: PhantomData<T>,
}

impl<'h, S, T> ReferenceAllocator<'h, S, T>
where
    S: Read + Write + Seek,
    T: Counted<S>,
{
    pub fn new<F>(heap: &'h Heap<S>, construct: F) -> Self
    where
        F: Fn(&'h Heap<S>, u64) -> T + 'h,
    {
        ReferenceAllocator { heap, construct: Box::new(construct), _t: PhantomData }
    }
}

impl<'h, S, T> Allocator<T> for ReferenceAllocator<'h, S, T>
where
    S: Read + Write + Seek,
    T: Counted<S>,
{
    fn alloc(&self, value: T) -> Result<u64> {
        value.incr_ref(self.heap)?;
        Ok(value.offset())
    }

    fn deref(&self, offset: u64) -> Result<T> {
        Ok((self.construct)(self.heap, offset))
    }

    fn free(&self, offset: u64) -> Result<()> {
        let handle = (self.construct)(self.heap, offset);
        let count = handle.decr_ref(self.heap)?;
        if count == 0 {
            handle.teardown(self.heap)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use std::io::Cursor;

    /// A toy counted object: an 8-byte heap cell holding `[ref_count:
    /// u32][payload: i32]`, just enough to exercise the allocator
    /// contract without pulling in `container.rs`.
    struct Cell<'h> {
        heap: &'h Heap<Cursor<Vec<u8>>>,
        offset: u64,
    }

    impl<'h> Cell<'h> {
        fn create(heap: &'h Heap<Cursor<Vec<u8>>>, payload: i32) -> Result<Cell<'h>> {
            let offset = heap.alloc(8)?;
            let mut buf = [0u8; 8];
            buf[..4].copy_from_slice(&1u32.to_le_bytes());
            buf[4..].copy_from_slice(&payload.to_le_bytes());
            heap.set(offset, &buf)?;
            Ok(Cell { heap, offset })
        }
    }

    impl<'h> Counted<Cursor<Vec<u8>>> for Cell<'h> {
        fn offset(&self) -> u64 {
            self.offset
        }

        fn incr_ref(&self, heap: &Heap<Cursor<Vec<u8>>>) -> Result<u32> {
            let mut buf = heap.get(self.offset)?;
            let count = u32::from_le_bytes(buf[..4].try_into().unwrap()) + 1;
            buf[..4].copy_from_slice(&count.to_le_bytes());
            heap.set(self.offset, &buf)?;
            Ok(count)
        }

        fn decr_ref(&self, heap: &Heap<Cursor<Vec<u8>>>) -> Result<u32> {
            let mut buf = heap.get(self.offset)?;
            let count = u32::from_le_bytes(buf[..4].try_into().unwrap()) - 1;
            buf[..4].copy_from_slice(&count.to_le_bytes());
            heap.set(self.offset, &buf)?;
            Ok(count)
        }

        fn teardown(self, heap: &Heap<Cursor<Vec<u8>>>) -> Result<()> {
            heap.free(self.offset)
        }
    }

    #[test]
    fn alloc_increments_free_decrements_and_tears_down_at_zero() {
        let heap = Heap::create(Cursor::new(Vec::new()), 4096).unwrap();
        let cell = Cell::create(&heap, 99).unwrap();
        let offset = cell.offset;
        let alloc = ReferenceAllocator::new(&heap, |h, o| Cell { heap: h, offset: o });

        let a = alloc.alloc(cell).unwrap();
        assert_eq!(a, offset);
        assert!(heap.is_valid(offset));

        alloc.free(offset).unwrap();
        assert!(heap.is_valid(offset), "ref count 2 -> 1, object still alive");

        alloc.free(offset).unwrap();
        assert!(!heap.is_valid(offset), "ref count dropped to 0, object torn down");
    }
}
