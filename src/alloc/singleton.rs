//! `SingletonAllocator<T>` deduplicates immutable, comparable values: the
//! same `T` stored twice yields the same offset and exactly one
//! serialized payload, reference-counted. Two structures share one heap:
//! an AA-tree index keyed by `T` itself (comparing by dereferencing the
//! indexed offset) and an object area where each payload is prefixed by
//! a 4-byte ref count.
//!
//! Grounded in the teacher's `vlog::Value::Native` vs `::Reference` split
//! (one canonical representation, referenced rather than duplicated) and
//! its `llrb.rs` index-of-comparable-keys shape, reused here via
//! `aatree::AaTree` rather than reimplemented.

use std::convert::TryInto;
use std::io::{Read, Seek, Write};
use std::marker::PhantomData;

use super::null::NullAllocator;
use super::Allocator;
use crate::aatree::AaTree;
use crate::codec::Codec;
use crate::error::Result;
use crate::heap::Heap;

/// Reads the index tree's key by decoding the object payload past its
/// 4-byte ref-count prefix. Never asked to `alloc`/`free` directly: the
/// index tree's `insert`/`remove` take already-allocated offsets and
/// leave freeing to the caller, and `SingletonAllocator` is that caller.
struct ObjectKeyAllocator<'h, S, T> {
    heap: &'h Heap<S>,
    _t: PhantomData<T>,
}

impl<'h, S: Read + Write + Seek, T: Codec> Allocator<T> for ObjectKeyAllocator<'h, S, T> {
    fn alloc(&self, _value: T) -> Result<u64> {
        unreachable!("SingletonAllocator manages object lifecycle, not the index tree")
    }

    fn deref(&self, offset: u64) -> Result<T> {
        let buf = self.heap.get(offset)?;
        T::decode(&buf[4..])
    }

    fn free(&self, _offset: u64) -> Result<()> {
        unreachable!("SingletonAllocator manages object lifecycle, not the index tree")
    }
}

type IndexTree<'h, S, T> = AaTree<'h, S, T, ObjectKeyAllocator<'h, S, T>, (), NullAllocator<()>>;

pub struct SingletonAllocator<'h, S, T> {
    heap: &'h Heap<S>,
    root_cell: u64,
    _t: PhantomData<T>,
}

impl<'h, S: Read + Write + Seek, T: Codec + Ord + Clone> SingletonAllocator<'h, S, T> {
    /// Allocate a fresh, empty index; returns the allocator plus the
    /// heap cell offset the caller should register as a root so the
    /// index can be found again after reopening the heap.
    pub fn create(heap: &'h Heap<S>) -> Result<(Self, u64)> {
        let cell = heap.alloc(8)?;
        heap.set(cell, &0i64.to_le_bytes())?;
        Ok((SingletonAllocator { heap, root_cell: cell, _t: PhantomData }, cell))
    }

    /// Reopen an index from a previously created root cell.
    pub fn open(heap: &'h Heap<S>, root_cell: u64) -> Self {
        SingletonAllocator { heap, root_cell, _t: PhantomData }
    }

    fn root(&self) -> Result<u64> {
        let buf = self.heap.get(self.root_cell)?;
        Ok(i64::from_le_bytes(buf[..8].try_into().unwrap()) as u64)
    }

    fn set_root(&self, root: u64) -> Result<()> {
        self.heap.set(self.root_cell, &(root as i64).to_le_bytes())
    }

    fn tree(&self) -> IndexTree<'h, S, T> {
        AaTree::new(self.heap, ObjectKeyAllocator { heap: self.heap, _t: PhantomData }, NullAllocator::new())
    }

    /// Reads just the 4-byte ref-count prefix through a bounds-checked
    /// cursor rather than fetching and re-slicing the whole payload.
    fn ref_count(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.heap.reader(offset)?.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn set_ref_count(&self, offset: u64, count: u32) -> Result<()> {
        self.heap.writer(offset)?.write_all(&count.to_le_bytes())?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.tree().count(self.root()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<'h, S: Read + Write + Seek, T: Codec + Ord + Clone> Allocator<T> for SingletonAllocator<'h, S, T> {
    fn alloc(&self, value: T) -> Result<u64> {
        let root = self.root()?;
        let tree = self.tree();
        if let Some(offset) = tree.get(root, &value)? {
            let count = self.ref_count(offset)?;
            self.set_ref_count(offset, count + 1)?;
            return Ok(offset);
        }
        let mut buf = vec![0u8; 4];
        value.encode(&mut buf);
        let offset = self.heap.alloc(buf.len())?;
        self.heap.set(offset, &buf)?;
        self.set_ref_count(offset, 1)?;
        let (new_root, prior) = tree.insert(root, &value, offset, 0)?;
        debug_assert!(prior.is_none(), "value was absent from the index a moment ago");
        self.set_root(new_root)?;
        Ok(offset)
    }

    fn deref(&self, offset: u64) -> Result<T> {
        let buf = self.heap.get(offset)?;
        T::decode(&buf[4..])
    }

    fn free(&self, offset: u64) -> Result<()> {
        let count = self.ref_count(offset)?;
        if count <= 1 {
            let value = self.deref(offset)?;
            let root = self.root()?;
            let tree = self.tree();
            let (new_root, _) = tree.remove(root, &value)?;
            self.set_root(new_root)?;
            self.heap.free(offset)
        } else {
            self.set_ref_count(offset, count - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn repeated_values_dedupe_to_one_offset() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let (alloc, _cell) = SingletonAllocator::<_, String>::create(&heap).unwrap();
        let a = alloc.alloc("hello".to_string()).unwrap();
        let b = alloc.alloc("hello".to_string()).unwrap();
        let c = alloc.alloc("world".to_string()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(alloc.deref(a).unwrap(), "hello");
        assert_eq!(alloc.len().unwrap(), 2);
    }

    #[test]
    fn ref_count_drop_to_zero_removes_entry() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let (alloc, _cell) = SingletonAllocator::<_, String>::create(&heap).unwrap();
        let a = alloc.alloc("x".to_string()).unwrap();
        let _b = alloc.alloc("x".to_string()).unwrap();
        alloc.free(a).unwrap();
        assert!(alloc.deref(a).is_ok(), "still one live reference");
        alloc.free(a).unwrap();
        assert!(alloc.is_empty().unwrap());
    }

    #[test]
    fn reopen_through_root_cell_finds_same_index() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let cell = {
            let (alloc, cell) = SingletonAllocator::<_, i64>::create(&heap).unwrap();
            alloc.alloc(7).unwrap();
            cell
        };
        let reopened = SingletonAllocator::<_, i64>::open(&heap, cell);
        assert_eq!(reopened.len().unwrap(), 1);
    }
}
