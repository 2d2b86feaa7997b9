//! `SortedMap<K, V>` and `SortedSet<T>` are thin clients over
//! `aatree::AaTree`: they own a heap cell (`[ref_count: u32][_pad: u32]
//! [size: u64][tree_root: i64]`) and the key/value allocators, and
//! translate the public ordered-container contract into AA-tree calls
//! plus the allocator bookkeeping the tree itself stays agnostic of.
//!
//! Grounded in the teacher's `llrb.rs` `Llrb<K, V>` — a named, latched,
//! counted wrapper around a balanced tree exposing `get`/`iter`/range
//! scans — generalized to a heap-persisted, ref-counted, nestable
//! container (so one `SortedMap` can be the value of another through
//! `alloc::ReferenceAllocator`, the way `index.rs` nests three of them).

use std::convert::TryInto;
use std::io::{Read, Seek, Write};
use std::marker::PhantomData;

use crate::aatree::AaTree;
use crate::alloc::null::NullAllocator;
use crate::alloc::reference::Counted;
use crate::alloc::Allocator;
use crate::constraint::Constraint;
use crate::error::Result;
use crate::heap::Heap;

// [0..4] ref_count, [8..16] size (entry count), [16..24] tree root offset.
// The size counter lives in this same cell rather than a wholly separate
// heap allocation: the cell offset is already the one handle a nested
// container is known by (to the tree that holds it and to the
// ReferenceAllocator that ref-counts it), so a second allocation would
// only add an extra pointer to persist, not remove one.
const CELL_LEN: usize = 24;

fn decode_cell(buf: &[u8]) -> (u32, u64, i64) {
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let size = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let root = i64::from_le_bytes(buf[16..24].try_into().unwrap());
    (count, size, root)
}

fn encode_cell(count: u32, size: u64, root: i64) -> [u8; CELL_LEN] {
    let mut buf = [0u8; CELL_LEN];
    buf[0..4].copy_from_slice(&count.to_le_bytes());
    buf[8..16].copy_from_slice(&size.to_le_bytes());
    buf[16..24].copy_from_slice(&root.to_le_bytes());
    buf
}

/// A persisted, ref-counted ordered map `K -> V`.
pub struct SortedMap<'h, S, K, KA, V, VA> {
    heap: &'h Heap<S>,
    cell: u64,
    keys: KA,
    values: VA,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<'h, S, K, KA, V, VA> SortedMap<'h, S, K, KA, V, VA>
where
    S: Read + Write + Seek,
    K: Ord + Clone,
    KA: Allocator<K>,
    VA: Allocator<V>,
{
    /// A freshly created map starts with a ref count of 0: it is not yet
    /// referenced by anyone. A caller that holds it directly (never
    /// nesting it inside another container through `ReferenceAllocator`)
    /// simply never touches the count. A caller that stores it as
    /// another container's value relies on that store's `alloc` to bring
    /// the count to 1.
    pub fn create(heap: &'h Heap<S>, keys: KA, values: VA) -> Result<Self> {
        let cell = heap.alloc(CELL_LEN)?;
        heap.set(cell, &encode_cell(0, 0, 0))?;
        Ok(SortedMap { heap, cell, keys, values, _k: PhantomData, _v: PhantomData })
    }

    pub fn open(heap: &'h Heap<S>, cell: u64, keys: KA, values: VA) -> Self {
        SortedMap { heap, cell, keys, values, _k: PhantomData, _v: PhantomData }
    }

    pub fn cell(&self) -> u64 {
        self.cell
    }

    fn root(&self) -> Result<u64> {
        Ok(decode_cell(&self.heap.get(self.cell)?).2 as u64)
    }

    fn set_root(&self, root: u64) -> Result<()> {
        let (count, size, _) = decode_cell(&self.heap.get(self.cell)?);
        self.heap.set(self.cell, &encode_cell(count, size, root as i64))
    }

    fn size(&self) -> Result<u64> {
        Ok(decode_cell(&self.heap.get(self.cell)?).1)
    }

    fn set_size(&self, size: u64) -> Result<()> {
        let (count, _, root) = decode_cell(&self.heap.get(self.cell)?);
        self.heap.set(self.cell, &encode_cell(count, size, root))
    }

    fn tree(&self) -> AaTree<'h, S, K, &KA, V, &VA> {
        AaTree::new(self.heap, &self.keys, &self.values)
    }

    /// O(1): reads the size counter maintained alongside the tree root
    /// rather than walking the tree.
    pub fn len(&self) -> Result<usize> {
        Ok(self.size()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.tree().contains(self.root()?, key)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        match self.tree().get(self.root()?, key)? {
            Some(off) => Ok(Some(self.values.deref(off)?)),
            None => Ok(None),
        }
    }

    /// Insert `key -> value`. If `key` was already present its prior
    /// value is freed and returned.
    pub fn add(&self, key: K, value: V) -> Result<Option<V>> {
        let key_off = self.keys.alloc(key.clone())?;
        let value_off = self.values.alloc(value)?;
        let root = self.root()?;
        let (new_root, prior) = self.tree().insert(root, &key, key_off, value_off)?;
        self.set_root(new_root)?;
        match prior {
            Some((old_key_off, old_value_off)) => {
                let old_value = self.values.deref(old_value_off)?;
                self.keys.free(old_key_off)?;
                self.values.free(old_value_off)?;
                Ok(Some(old_value))
            }
            None => {
                let size = self.size()?;
                self.set_size(size + 1)?;
                Ok(None)
            }
        }
    }

    /// Remove `key`, freeing its key/value allocations. Returns the
    /// removed value if it was present. For a `ReferenceAllocator`
    /// value whose ref count drops to zero here, the returned handle
    /// points at storage this call has already torn down; any further
    /// heap access through it surfaces as an ordinary heap error rather
    /// than silently reading reused space.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let root = self.root()?;
        let (new_root, removed) = self.tree().remove(root, key)?;
        self.set_root(new_root)?;
        match removed {
            Some((key_off, value_off)) => {
                let value = self.values.deref(value_off)?;
                self.keys.free(key_off)?;
                self.values.free(value_off)?;
                let size = self.size()?;
                self.set_size(size - 1)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Free every key and value, then reset the root. Intermediate
    /// heap blocks (the tree's own nodes) are freed through `AaTree`.
    pub fn clear(&self) -> Result<()> {
        let root = self.root()?;
        self.tree().clear(root)?;
        self.set_root(0)?;
        self.set_size(0)
    }

    pub fn iter(&self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        self.tree().for_each(self.root()?, &mut |k, v_off| {
            out.push((k.clone(), self.values.deref(v_off)?));
            Ok(())
        })?;
        Ok(out)
    }

    /// Entries satisfying `constraint`, in ascending key order.
    pub fn constrain_by(&self, constraint: &Constraint<K>) -> Result<Vec<(K, V)>> {
        let root = self.root()?;
        let tree = self.tree();
        let mut out = Vec::new();
        match constraint {
            Constraint::Any => {
                tree.for_each(root, &mut |k, v_off| {
                    out.push((k.clone(), self.values.deref(v_off)?));
                    Ok(())
                })?;
            }
            Constraint::Specific(x) => {
                if let Some(v_off) = tree.get(root, x)? {
                    out.push((x.clone(), self.values.deref(v_off)?));
                }
            }
            Constraint::Range { lo, hi, lo_inclusive, hi_inclusive } => {
                tree.for_each_range(root, lo.as_ref(), *lo_inclusive, hi.as_ref(), *hi_inclusive, &mut |k, v_off| {
                    out.push((k.clone(), self.values.deref(v_off)?));
                    Ok(())
                })?;
            }
            Constraint::Set(values) => {
                let mut keys: Vec<&K> = values.iter().collect();
                keys.sort();
                for k in keys {
                    if let Some(v_off) = tree.get(root, k)? {
                        out.push((k.clone(), self.values.deref(v_off)?));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl<'h, S, K, KA, V, VA> Counted<S> for SortedMap<'h, S, K, KA, V, VA>
where
    S: Read + Write + Seek,
    K: Ord + Clone,
    KA: Allocator<K>,
    VA: Allocator<V>,
{
    fn offset(&self) -> u64 {
        self.cell
    }

    fn incr_ref(&self, heap: &Heap<S>) -> Result<u32> {
        let (count, size, root) = decode_cell(&heap.get(self.cell)?);
        let count = count + 1;
        heap.set(self.cell, &encode_cell(count, size, root))?;
        Ok(count)
    }

    fn decr_ref(&self, heap: &Heap<S>) -> Result<u32> {
        let (count, size, root) = decode_cell(&heap.get(self.cell)?);
        let count = count - 1;
        heap.set(self.cell, &encode_cell(count, size, root))?;
        Ok(count)
    }

    fn teardown(self, heap: &Heap<S>) -> Result<()> {
        self.clear()?;
        heap.free(self.cell)
    }
}

/// A persisted, ref-counted ordered set, implemented as a map to the
/// unit value stored inline (`NullAllocator<()>` consumes no heap
/// space for it).
pub struct SortedSet<'h, S, T, KA> {
    inner: SortedMap<'h, S, T, KA, (), NullAllocator<()>>,
}

impl<'h, S, T, KA> SortedSet<'h, S, T, KA>
where
    S: Read + Write + Seek,
    T: Ord + Clone,
    KA: Allocator<T>,
{
    pub fn create(heap: &'h Heap<S>, keys: KA) -> Result<Self> {
        Ok(SortedSet { inner: SortedMap::create(heap, keys, NullAllocator::new())? })
    }

    pub fn open(heap: &'h Heap<S>, cell: u64, keys: KA) -> Self {
        SortedSet { inner: SortedMap::open(heap, cell, keys, NullAllocator::new()) }
    }

    pub fn cell(&self) -> u64 {
        self.inner.cell()
    }

    pub fn len(&self) -> Result<usize> {
        self.inner.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.inner.is_empty()
    }

    pub fn contains(&self, value: &T) -> Result<bool> {
        self.inner.contains_key(value)
    }

    /// Inserts `value`; returns `true` if it was newly added.
    pub fn add(&self, value: T) -> Result<bool> {
        Ok(self.inner.add(value, ())?.is_none())
    }

    pub fn remove(&self, value: &T) -> Result<bool> {
        Ok(self.inner.remove(value)?.is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    pub fn iter(&self) -> Result<Vec<T>> {
        Ok(self.inner.iter()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn constrain_by(&self, constraint: &Constraint<T>) -> Result<Vec<T>> {
        Ok(self.inner.constrain_by(constraint)?.into_iter().map(|(k, _)| k).collect())
    }
}

impl<'h, S, T, KA> Counted<S> for SortedSet<'h, S, T, KA>
where
    S: Read + Write + Seek,
    T: Ord + Clone,
    KA: Allocator<T>,
{
    fn offset(&self) -> u64 {
        self.inner.offset()
    }

    fn incr_ref(&self, heap: &Heap<S>) -> Result<u32> {
        self.inner.incr_ref(heap)
    }

    fn decr_ref(&self, heap: &Heap<S>) -> Result<u32> {
        self.inner.decr_ref(heap)
    }

    fn teardown(self, heap: &Heap<S>) -> Result<()> {
        self.inner.teardown(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::null::NullAllocator;
    use std::io::Cursor;

    #[test]
    fn map_add_get_remove_roundtrip() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let map = SortedMap::create(&heap, NullAllocator::<i64>::new(), NullAllocator::<i64>::new()).unwrap();
        assert_eq!(map.add(1, 100).unwrap(), None);
        assert_eq!(map.add(2, 200).unwrap(), None);
        assert_eq!(map.add(1, 999).unwrap(), Some(100));
        assert_eq!(map.get(&1).unwrap(), Some(999));
        assert_eq!(map.remove(&2).unwrap(), Some(200));
        assert_eq!(map.get(&2).unwrap(), None);
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn map_iter_is_ascending() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let map = SortedMap::create(&heap, NullAllocator::<i64>::new(), NullAllocator::<i64>::new()).unwrap();
        for k in [5, 1, 9, 3, 7] {
            map.add(k, k * 2).unwrap();
        }
        let got: Vec<i64> = map.iter().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(got, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn set_add_is_idempotent() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let set = SortedSet::create(&heap, NullAllocator::<i64>::new()).unwrap();
        assert!(set.add(1).unwrap());
        assert!(!set.add(1).unwrap());
        assert_eq!(set.len().unwrap(), 1);
        assert!(set.remove(&1).unwrap());
        assert!(set.is_empty().unwrap());
    }

    #[test]
    fn nested_container_via_reference_allocator_has_single_owner() {
        use crate::alloc::reference::ReferenceAllocator;

        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        type Inner<'h> = SortedSet<'h, Cursor<Vec<u8>>, i64, NullAllocator<i64>>;
        let values = ReferenceAllocator::new(&heap, |h, o| Inner::open(h, o, NullAllocator::new()));
        let outer = SortedMap::create(&heap, NullAllocator::<i64>::new(), values).unwrap();

        let inner = Inner::create(&heap, NullAllocator::new()).unwrap();
        let inner_cell = inner.cell();
        inner.add(7).unwrap();
        outer.add(1, inner).unwrap();

        assert!(heap.is_valid(inner_cell), "nested container alive after one store");
        outer.remove(&1).unwrap();
        assert!(!heap.is_valid(inner_cell), "single owner torn down on removal, not merely decremented");
    }

    #[test]
    fn clear_frees_values_through_allocator() {
        let heap = Heap::create(Cursor::new(Vec::new()), 16384).unwrap();
        let (alloc, _cell) =
            crate::alloc::singleton::SingletonAllocator::<_, String>::create(&heap).unwrap();
        let map = SortedMap::create(&heap, NullAllocator::<i64>::new(), alloc).unwrap();
        map.add(1, "hello".to_string()).unwrap();
        map.add(2, "world".to_string()).unwrap();
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
    }
}
