//! A persisted AA-tree: the balanced-BST core that `SortedMap`/`SortedSet`
//! in `container.rs` sit on top of. Nodes live in the heap as fixed-width
//! blocks; keys and values are themselves heap offsets produced by a
//! caller-supplied allocator, so the tree never needs to know how `K`/`V`
//! are represented on the wire.
//!
//! Rotation-based rebalancing (`skew`/`split`) is Andersson's AA-tree
//! algorithm; the recursive insert/delete-with-successor-promotion shape
//! mirrors the teacher's `llrb.rs` red-black tree, adapted from red/black
//! color bits to AA levels because the spec calls for an AA-tree
//! specifically (levels persist more simply than colors across a byte
//! stream: no parent pointers needed to recolor during rebalance).

use std::cmp::Ordering;
use std::convert::TryInto;
use std::io::{Read, Seek, Write};
use std::marker::PhantomData;

use crate::alloc::Allocator;
use crate::error::Result;
use crate::heap::Heap;

const NODE_LEN: usize = 40;

struct Node {
    level: i64,
    left: u64,
    right: u64,
    key: u64,
    value: u64,
}

fn decode_node(buf: &[u8]) -> Node {
    let w = |i: usize| i64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
    Node { level: w(0), left: w(1) as u64, right: w(2) as u64, key: w(3) as u64, value: w(4) as u64 }
}

fn encode_node(n: &Node) -> [u8; NODE_LEN] {
    let mut buf = [0u8; NODE_LEN];
    let fields = [n.level, n.left as i64, n.right as i64, n.key as i64, n.value as i64];
    for (i, v) in fields.iter().enumerate() {
        buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Persisted AA-tree over heap `S`, keyed by `K` through allocator `KA`
/// and valued by `V` through allocator `VA`. Operations take and return
/// the subtree root explicitly; the caller (a `SortedMap`/`SortedSet`)
/// owns where that root offset is stored (a heap root record).
pub struct AaTree<'h, S, K, KA, V, VA> {
    heap: &'h Heap<S>,
    keys: KA,
    values: VA,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<'h, S, K, KA, V, VA> AaTree<'h, S, K, KA, V, VA>
where
    S: Read + Write + Seek,
    K: Ord + Clone,
    KA: Allocator<K>,
    VA: Allocator<V>,
{
    pub fn new(heap: &'h Heap<S>, keys: KA, values: VA) -> Self {
        AaTree { heap, keys, values, _k: PhantomData, _v: PhantomData }
    }

    pub fn keys(&self) -> &KA {
        &self.keys
    }

    pub fn values(&self) -> &VA {
        &self.values
    }

    fn read_node(&self, offset: u64) -> Result<Node> {
        Ok(decode_node(&self.heap.get(offset)?))
    }

    fn write_node(&self, offset: u64, node: &Node) -> Result<()> {
        self.heap.set(offset, &encode_node(node))
    }

    fn alloc_node(&self, node: Node) -> Result<u64> {
        let offset = self.heap.alloc(NODE_LEN)?;
        self.write_node(offset, &node)?;
        Ok(offset)
    }

    fn free_node(&self, offset: u64) -> Result<()> {
        self.heap.free(offset)
    }

    fn level_of(&self, offset: u64) -> Result<i64> {
        if offset == 0 {
            Ok(0)
        } else {
            Ok(self.read_node(offset)?.level)
        }
    }

    fn skew(&self, t: u64) -> Result<u64> {
        if t == 0 {
            return Ok(0);
        }
        let mut node = self.read_node(t)?;
        if node.left == 0 {
            return Ok(t);
        }
        let mut left = self.read_node(node.left)?;
        if left.level == node.level {
            let l = node.left;
            node.left = left.right;
            self.write_node(t, &node)?;
            left.right = t;
            self.write_node(l, &left)?;
            return Ok(l);
        }
        Ok(t)
    }

    fn split(&self, t: u64) -> Result<u64> {
        if t == 0 {
            return Ok(0);
        }
        let mut node = self.read_node(t)?;
        if node.right == 0 {
            return Ok(t);
        }
        let mut right = self.read_node(node.right)?;
        if right.right == 0 {
            return Ok(t);
        }
        let right_right_level = self.level_of(right.right)?;
        if node.level == right_right_level {
            let r = node.right;
            node.right = right.left;
            self.write_node(t, &node)?;
            right.left = t;
            right.level += 1;
            self.write_node(r, &right)?;
            return Ok(r);
        }
        Ok(t)
    }

    /// Insert `key` (already serialized at `key_off` by the caller) with
    /// value `value_off`, returning the new subtree root. If `key` was
    /// already present, returns the *previous* `(key_off, value_off)` so
    /// the caller can free the now-redundant offsets (the new key_off
    /// the caller allocated replaces it in the node regardless, so a
    /// singleton-deduplicated key's ref count nets out unchanged).
    pub fn insert(
        &self,
        root: u64,
        key: &K,
        key_off: u64,
        value_off: u64,
    ) -> Result<(u64, Option<(u64, u64)>)> {
        if root == 0 {
            let off = self.alloc_node(Node { level: 1, left: 0, right: 0, key: key_off, value: value_off })?;
            return Ok((off, None));
        }
        let mut node = self.read_node(root)?;
        let existing = self.keys.deref(node.key)?;
        let prior = match key.cmp(&existing) {
            Ordering::Less => {
                let (nl, prior) = self.insert(node.left, key, key_off, value_off)?;
                node.left = nl;
                self.write_node(root, &node)?;
                prior
            }
            Ordering::Greater => {
                let (nr, prior) = self.insert(node.right, key, key_off, value_off)?;
                node.right = nr;
                self.write_node(root, &node)?;
                prior
            }
            Ordering::Equal => {
                let prior = Some((node.key, node.value));
                node.key = key_off;
                node.value = value_off;
                self.write_node(root, &node)?;
                prior
            }
        };
        let t = self.skew(root)?;
        let t = self.split(t)?;
        Ok((t, prior))
    }

    /// Remove `key`, returning the new subtree root and the removed
    /// `(key_off, value_off)` if present. Freeing those offsets through
    /// the key/value allocators is the caller's responsibility.
    pub fn remove(&self, root: u64, key: &K) -> Result<(u64, Option<(u64, u64)>)> {
        if root == 0 {
            return Ok((0, None));
        }
        let mut node = self.read_node(root)?;
        let node_key = self.keys.deref(node.key)?;
        let (mut t, removed) = match key.cmp(&node_key) {
            Ordering::Less => {
                let (nl, r) = self.remove(node.left, key)?;
                node.left = nl;
                self.write_node(root, &node)?;
                (root, r)
            }
            Ordering::Greater => {
                let (nr, r) = self.remove(node.right, key)?;
                node.right = nr;
                self.write_node(root, &node)?;
                (root, r)
            }
            Ordering::Equal => {
                let removed = Some((node.key, node.value));
                if node.left == 0 {
                    self.free_node(root)?;
                    return Ok((node.right, removed));
                } else if node.right == 0 {
                    self.free_node(root)?;
                    return Ok((node.left, removed));
                } else {
                    let (nr, succ) = self.remove_min(node.right)?;
                    let (succ_key, succ_val) = succ.expect("non-empty right subtree has a minimum");
                    node.key = succ_key;
                    node.value = succ_val;
                    node.right = nr;
                    self.write_node(root, &node)?;
                    (root, removed)
                }
            }
        };
        t = self.rebalance_after_delete(t)?;
        Ok((t, removed))
    }

    fn remove_min(&self, t: u64) -> Result<(u64, Option<(u64, u64)>)> {
        let node = self.read_node(t)?;
        if node.left == 0 {
            let kv = (node.key, node.value);
            self.free_node(t)?;
            return Ok((node.right, Some(kv)));
        }
        let (nl, kv) = self.remove_min(node.left)?;
        let mut node = node;
        node.left = nl;
        self.write_node(t, &node)?;
        let tt = self.rebalance_after_delete(t)?;
        Ok((tt, kv))
    }

    fn rebalance_after_delete(&self, t: u64) -> Result<u64> {
        if t == 0 {
            return Ok(0);
        }
        let mut node = self.read_node(t)?;
        let left_level = self.level_of(node.left)?;
        let right_level = self.level_of(node.right)?;
        if left_level >= node.level - 1 && right_level >= node.level - 1 {
            return Ok(t);
        }
        node.level -= 1;
        if right_level > node.level {
            let mut right = self.read_node(node.right)?;
            right.level = node.level;
            self.write_node(node.right, &right)?;
        }
        self.write_node(t, &node)?;

        let mut tt = self.skew(t)?;
        let n = self.read_node(tt)?;
        if n.right != 0 {
            let new_right = self.skew(n.right)?;
            let mut n2 = self.read_node(tt)?;
            n2.right = new_right;
            self.write_node(tt, &n2)?;
            let n3 = self.read_node(tt)?;
            if n3.right != 0 {
                let rnode = self.read_node(n3.right)?;
                if rnode.right != 0 {
                    let new_rr = self.skew(rnode.right)?;
                    let mut rnode2 = self.read_node(n3.right)?;
                    rnode2.right = new_rr;
                    self.write_node(n3.right, &rnode2)?;
                }
            }
        }
        tt = self.split(tt)?;
        let n = self.read_node(tt)?;
        if n.right != 0 {
            let new_right = self.split(n.right)?;
            let mut n2 = self.read_node(tt)?;
            n2.right = new_right;
            self.write_node(tt, &n2)?;
        }
        Ok(tt)
    }

    pub fn get(&self, root: u64, key: &K) -> Result<Option<u64>> {
        if root == 0 {
            return Ok(None);
        }
        let node = self.read_node(root)?;
        let node_key = self.keys.deref(node.key)?;
        match key.cmp(&node_key) {
            Ordering::Less => self.get(node.left, key),
            Ordering::Greater => self.get(node.right, key),
            Ordering::Equal => Ok(Some(node.value)),
        }
    }

    pub fn contains(&self, root: u64, key: &K) -> Result<bool> {
        Ok(self.get(root, key)?.is_some())
    }

    pub fn count(&self, root: u64) -> Result<usize> {
        if root == 0 {
            return Ok(0);
        }
        let node = self.read_node(root)?;
        Ok(1 + self.count(node.left)? + self.count(node.right)?)
    }

    /// In-order walk over the half-open/closed range `[lo, hi]`, pruning
    /// subtrees that cannot satisfy the bound rather than visiting and
    /// discarding — the "seek to lower bound" behavior the spec asks for.
    pub fn for_each_range<F>(
        &self,
        root: u64,
        lo: Option<&K>,
        lo_inclusive: bool,
        hi: Option<&K>,
        hi_inclusive: bool,
        f: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&K, u64) -> Result<()>,
    {
        if root == 0 {
            return Ok(());
        }
        let node = self.read_node(root)?;
        let node_key = self.keys.deref(node.key)?;
        let below_lo = match lo {
            Some(l) => match node_key.cmp(l) {
                Ordering::Less => true,
                Ordering::Equal => !lo_inclusive,
                Ordering::Greater => false,
            },
            None => false,
        };
        let above_hi = match hi {
            Some(h) => match node_key.cmp(h) {
                Ordering::Greater => true,
                Ordering::Equal => !hi_inclusive,
                Ordering::Less => false,
            },
            None => false,
        };
        if !below_lo {
            self.for_each_range(node.left, lo, lo_inclusive, hi, hi_inclusive, f)?;
        }
        if !below_lo && !above_hi {
            f(&node_key, node.value)?;
        }
        if !above_hi {
            self.for_each_range(node.right, lo, lo_inclusive, hi, hi_inclusive, f)?;
        }
        Ok(())
    }

    pub fn for_each<F>(&self, root: u64, f: &mut F) -> Result<()>
    where
        F: FnMut(&K, u64) -> Result<()>,
    {
        self.for_each_range(root, None, true, None, true, f)
    }

    /// Frees every node and every key/value offset reachable from
    /// `root`. Does not touch the caller's stored root pointer.
    pub fn clear(&self, root: u64) -> Result<()> {
        if root == 0 {
            return Ok(());
        }
        let node = self.read_node(root)?;
        self.clear(node.left)?;
        self.clear(node.right)?;
        self.keys.free(node.key)?;
        self.values.free(node.value)?;
        self.free_node(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::null::NullAllocator;
    use std::io::Cursor;

    fn tree(heap: &Heap<Cursor<Vec<u8>>>) -> AaTree<'_, Cursor<Vec<u8>>, i64, NullAllocator<i64>, i64, NullAllocator<i64>> {
        AaTree::new(heap, NullAllocator::new(), NullAllocator::new())
    }

    #[test]
    fn insert_get_inorder() {
        let heap = Heap::create(Cursor::new(Vec::new()), 8192).unwrap();
        let t = tree(&heap);
        let mut root = 0u64;
        for k in [5i64, 1, 9, 3, 7, 2, 8, 0, 4, 6] {
            let key_off = t.keys().alloc(k).unwrap();
            let val_off = t.values().alloc(k * 10).unwrap();
            let (new_root, _) = t.insert(root, &k, key_off, val_off).unwrap();
            root = new_root;
        }
        assert_eq!(t.count(root).unwrap(), 10);
        let mut seen = Vec::new();
        t.for_each(root, &mut |k, v| {
            seen.push((*k, v as i64));
            Ok(())
        })
        .unwrap();
        let expect: Vec<(i64, i64)> = (0..10).map(|k| (k, k * 10)).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn remove_shrinks_tree_and_keeps_order() {
        let heap = Heap::create(Cursor::new(Vec::new()), 8192).unwrap();
        let t = tree(&heap);
        let mut root = 0u64;
        for k in 0i64..20 {
            let key_off = t.keys().alloc(k).unwrap();
            let val_off = t.values().alloc(k).unwrap();
            let (r, _) = t.insert(root, &k, key_off, val_off).unwrap();
            root = r;
        }
        for k in (0i64..20).step_by(2) {
            let (r, removed) = t.remove(root, &k).unwrap();
            assert!(removed.is_some());
            root = r;
        }
        assert_eq!(t.count(root).unwrap(), 10);
        let mut seen = Vec::new();
        t.for_each(root, &mut |k, _| {
            seen.push(*k);
            Ok(())
        })
        .unwrap();
        let expect: Vec<i64> = (0..20).step_by(2).map(|k| k + 1).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn range_query_prunes_to_bounds() {
        let heap = Heap::create(Cursor::new(Vec::new()), 8192).unwrap();
        let t = tree(&heap);
        let mut root = 0u64;
        for k in 0i64..20 {
            let key_off = t.keys().alloc(k).unwrap();
            let val_off = t.values().alloc(k).unwrap();
            let (r, _) = t.insert(root, &k, key_off, val_off).unwrap();
            root = r;
        }
        let mut seen = Vec::new();
        t.for_each_range(root, Some(&5), true, Some(&10), false, &mut |k, _| {
            seen.push(*k);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (5..10).collect::<Vec<_>>());
    }

    #[test]
    fn fuzz_insert_remove_matches_btreeset() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeSet;
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 20).unwrap();
        let t = tree(&heap);
        let mut root = 0u64;
        let mut model: BTreeSet<i64> = BTreeSet::new();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..400 {
            let k = rng.gen_range(0..100);
            if model.contains(&k) {
                let (r, removed) = t.remove(root, &k).unwrap();
                assert!(removed.is_some());
                root = r;
                model.remove(&k);
            } else {
                let key_off = t.keys().alloc(k).unwrap();
                let val_off = t.values().alloc(k).unwrap();
                let (r, _) = t.insert(root, &k, key_off, val_off).unwrap();
                root = r;
                model.insert(k);
            }
            let mut seen = Vec::new();
            t.for_each(root, &mut |k, _| {
                seen.push(*k);
                Ok(())
            })
            .unwrap();
            assert_eq!(seen, model.iter().cloned().collect::<Vec<_>>());
        }
    }
}
