//! `Index` is three nested persisted ordered containers keyed by interned
//! terms: `Map<Term -> Map<Term -> Set<Term>>>`. A single shared
//! `SingletonAllocator<Term>` interns every term that appears at any of
//! the three levels, so `"alice"` as a primary and `"alice"` as a
//! ternary share one serialized payload.
//!
//! Grounded in the teacher's `Llrb`/`shallow_clone` composition pattern
//! (one balanced tree nested as another's value through a shared,
//! cheaply-rebuilt handle) generalized from "one level of key/value" to
//! "three levels of key/container", and in `scans.rs`'s recursive bounded
//! walk for `enumerate`'s nested descent.

use std::io::{Read, Seek, Write};

use log::debug;

use crate::alloc::reference::ReferenceAllocator;
use crate::alloc::singleton::SingletonAllocator;
use crate::constraint::Constraint;
use crate::container::{SortedMap, SortedSet};
use crate::error::Result;
use crate::heap::Heap;
use crate::spinlock::{ReadGuard, RwSpin};
use crate::view::{ConstrainedView, UnionView};

pub type Term = String;

type TermAlloc<'h, S> = SingletonAllocator<'h, S, Term>;
type Leaf<'h, S> = SortedSet<'h, S, Term, TermAlloc<'h, S>>;
type LeafAlloc<'h, S> = ReferenceAllocator<'h, S, Leaf<'h, S>>;
type Middle<'h, S> = SortedMap<'h, S, Term, TermAlloc<'h, S>, Leaf<'h, S>, LeafAlloc<'h, S>>;
type MiddleAlloc<'h, S> = ReferenceAllocator<'h, S, Middle<'h, S>>;
type Outer<'h, S> = SortedMap<'h, S, Term, TermAlloc<'h, S>, Middle<'h, S>, MiddleAlloc<'h, S>>;

/// Three-level persisted triple index: primary -> secondary -> set of
/// ternary terms. Holds its own read/writer latch distinct from the
/// heap's: the spec permits the index to reenter its own read lock
/// while a `view`'s nested descent is in progress, which the heap's
/// latch does not (and must not, to keep its contract simple).
pub struct Index<'h, S> {
    heap: &'h Heap<S>,
    term_cell: u64,
    outer_cell: u64,
    latch: RwSpin,
}

impl<'h, S> Index<'h, S>
where
    S: Read + Write + Seek,
{
    /// Allocates a fresh, empty index. The two cell offsets returned
    /// alongside `self` (via `term_cell()`/`outer_cell()`) are what a
    /// caller registers as named heap roots to find this index again
    /// after reopening.
    pub fn create(heap: &'h Heap<S>) -> Result<Self> {
        let (_terms, term_cell) = SingletonAllocator::<_, Term>::create(heap)?;
        let outer = Outer::create(heap, TermAlloc::open(heap, term_cell), Self::middle_alloc_for(heap, term_cell))?;
        let outer_cell = outer.cell();
        Ok(Index { heap, term_cell, outer_cell, latch: RwSpin::new() })
    }

    /// Rebuilds a handle to a previously created index from its two
    /// heap cell offsets.
    pub fn open(heap: &'h Heap<S>, term_cell: u64, outer_cell: u64) -> Self {
        Index { heap, term_cell, outer_cell, latch: RwSpin::new() }
    }

    pub fn term_cell(&self) -> u64 {
        self.term_cell
    }

    pub fn outer_cell(&self) -> u64 {
        self.outer_cell
    }

    fn term_alloc(&self) -> TermAlloc<'h, S> {
        TermAlloc::open(self.heap, self.term_cell)
    }

    fn leaf_alloc(&self) -> LeafAlloc<'h, S> {
        Self::leaf_alloc_for(self.heap, self.term_cell)
    }

    fn leaf_alloc_for(heap: &'h Heap<S>, term_cell: u64) -> LeafAlloc<'h, S> {
        ReferenceAllocator::new(heap, move |h, o| Leaf::open(h, o, TermAlloc::open(h, term_cell)))
    }

    fn middle_alloc_for(heap: &'h Heap<S>, term_cell: u64) -> MiddleAlloc<'h, S> {
        ReferenceAllocator::new(heap, move |h, o| {
            Middle::open(h, o, TermAlloc::open(h, term_cell), Self::leaf_alloc_for(h, term_cell))
        })
    }

    fn outer(&self) -> Outer<'h, S> {
        Outer::open(self.heap, self.outer_cell, self.term_alloc(), Self::middle_alloc_for(self.heap, self.term_cell))
    }

    /// Inserts `(p, s, t)`. Idempotent: adding the same triple twice
    /// leaves the structure unchanged. Missing intermediate containers
    /// are created as needed.
    pub fn add(&self, p: &str, s: &str, t: &str) -> Result<()> {
        let _guard = self.latch.write();
        let outer = self.outer();
        let p_term = p.to_string();
        if outer.get(&p_term)?.is_none() {
            let middle = Middle::create(self.heap, self.term_alloc(), self.leaf_alloc())?;
            outer.add(p_term.clone(), middle)?;
        }
        let middle = outer.get(&p_term)?.expect("just inserted or already present");

        let s_term = s.to_string();
        if middle.get(&s_term)?.is_none() {
            let leaf = Leaf::create(self.heap, self.term_alloc())?;
            middle.add(s_term.clone(), leaf)?;
        }
        let leaf = middle.get(&s_term)?.expect("just inserted or already present");

        if leaf.add(t.to_string())? {
            debug!("index: added ({}, {}, {})", p, s, t);
        }
        Ok(())
    }

    /// Removes triples matching `(p, s, t)`, where an empty string at
    /// any position means "every value at that level". Intermediate
    /// containers are left in place (possibly empty); `enumerate` skips
    /// empty ones.
    pub fn remove(&self, p: &str, s: &str, t: &str) -> Result<()> {
        let _guard = self.latch.write();
        let outer = self.outer();
        let primaries: Vec<String> = if p.is_empty() {
            outer.iter()?.into_iter().map(|(k, _)| k).collect()
        } else {
            vec![p.to_string()]
        };

        for p_term in primaries {
            let middle = match outer.get(&p_term)? {
                Some(m) => m,
                None => continue,
            };
            let secondaries: Vec<String> = if s.is_empty() {
                middle.iter()?.into_iter().map(|(k, _)| k).collect()
            } else {
                vec![s.to_string()]
            };
            for s_term in secondaries {
                let leaf = match middle.get(&s_term)? {
                    Some(l) => l,
                    None => continue,
                };
                if t.is_empty() {
                    leaf.clear()?;
                } else {
                    leaf.remove(&t.to_string())?;
                }
            }
        }
        debug!("index: removed ({:?}, {:?}, {:?})", p, s, t);
        Ok(())
    }

    pub fn contains_p(&self, p: &str) -> Result<bool> {
        let _guard = self.latch.read();
        self.outer().contains_key(&p.to_string())
    }

    pub fn contains_ps(&self, p: &str, s: &str) -> Result<bool> {
        let _guard = self.latch.read();
        match self.outer().get(&p.to_string())? {
            Some(middle) => {
                match middle.get(&s.to_string())? {
                    Some(leaf) => Ok(leaf.len()? > 0),
                    None => Ok(false),
                }
            }
            None => Ok(false),
        }
    }

    pub fn contains_pst(&self, p: &str, s: &str, t: &str) -> Result<bool> {
        let _guard = self.latch.read();
        match self.outer().get(&p.to_string())? {
            Some(middle) => match middle.get(&s.to_string())? {
                Some(leaf) => leaf.contains(&t.to_string()),
                None => Ok(false),
            },
            None => Ok(false),
        }
    }

    /// Wipes the outer map. Every middle/leaf container it referenced is
    /// torn down through the ordinary ref-counting path.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.latch.write();
        self.outer().clear()
    }

    /// Rows satisfying the three constraints, ascending by `(p, s, t)`.
    /// Row width varies with how pinned `c_p`/`c_s` are: a specific
    /// primary and secondary yield `[t]` rows; a specific primary alone
    /// yields `[s, t]`; otherwise rows are the full `[p, s, t]`.
    ///
    /// Holds the index's read lock for the returned iterator's entire
    /// lifetime: only the outer level is resolved up front, `(s, t)`
    /// descent happens lazily as the caller pulls rows, so a writer
    /// cannot interleave a mutation partway through a caller's scan.
    pub fn enumerate<'i>(
        &'i self,
        c_p: &Constraint<Term>,
        c_s: &Constraint<Term>,
        c_t: &Constraint<Term>,
    ) -> Result<EnumerateIter<'i, 'h, S>> {
        let guard = self.latch.read();
        let p_pinned = c_p.as_specific().is_some();
        let s_pinned = c_s.as_specific().is_some();
        let outer_items = self.outer().constrain_by(c_p)?;
        Ok(EnumerateIter {
            _guard: guard,
            p_pinned,
            s_pinned,
            c_s: c_s.clone(),
            c_t: c_t.clone(),
            outer: outer_items.into_iter(),
            current_p: None,
            middles: Vec::new().into_iter(),
            current_s: None,
            leaves: Vec::new().into_iter(),
        })
    }

    /// A cursor over every ternary term reachable through `(c_p, c_s,
    /// c_t)`: one lazily-fetched group per matching `(p, s)` pair,
    /// concatenated by a `UnionView` that holds the read lock for as
    /// long as the caller keeps pulling from it.
    pub fn views<'i>(
        &'i self,
        c_p: &Constraint<Term>,
        c_s: &Constraint<Term>,
        c_t: &Constraint<Term>,
    ) -> Result<UnionView<'i, Term>> {
        let guard = self.latch.read();
        let outer_items = self.outer().constrain_by(c_p)?;
        let groups = Groups { outer: outer_items.into_iter(), middles: Vec::new().into_iter(), c_s: c_s.clone(), c_t: c_t.clone() };
        Ok(UnionView::new(guard, groups))
    }

    /// A cursor over the ternary terms under one exact `(p, s)` pair,
    /// holding the read lock until the caller drops it.
    pub fn view<'i>(&'i self, p: &str, s: &str, c_t: &Constraint<Term>) -> Result<ConstrainedView<'i, Term>> {
        let guard = self.latch.read();
        let terms = match self.outer().get(&p.to_string())? {
            Some(middle) => match middle.get(&s.to_string())? {
                Some(leaf) => leaf.constrain_by(c_t)?,
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        Ok(ConstrainedView::new(guard, terms))
    }

    /// A text diagnostic listing every `(p, s)` pair and its leaf size,
    /// for tests and debugging only.
    pub fn dump(&self) -> Result<String> {
        let _guard = self.latch.read();
        let outer = self.outer();
        let mut out = String::new();
        for (p, middle) in outer.iter()? {
            for (s, leaf) in middle.iter()? {
                out.push_str(&format!("{} {} -> {} term(s)\n", p, s, leaf.len()?));
            }
        }
        Ok(out)
    }
}

/// Lazily walks `(p, s)` pairs one at a time, resolving a pair's leaf
/// terms only when the previous pair's terms have been exhausted.
/// Backs `Index::views`.
struct Groups<'h, S> {
    outer: std::vec::IntoIter<(Term, Middle<'h, S>)>,
    middles: std::vec::IntoIter<(Term, Leaf<'h, S>)>,
    c_s: Constraint<Term>,
    c_t: Constraint<Term>,
}

impl<'h, S> Iterator for Groups<'h, S>
where
    S: Read + Write + Seek,
{
    type Item = Result<Vec<Term>>;

    fn next(&mut self) -> Option<Result<Vec<Term>>> {
        loop {
            if let Some((_, leaf)) = self.middles.next() {
                return Some(leaf.constrain_by(&self.c_t));
            }
            let (_, middle) = self.outer.next()?;
            match middle.constrain_by(&self.c_s) {
                Ok(entries) => self.middles = entries.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Lazily walks `(p, s, t)` rows, holding the index's read guard for its
/// own lifetime. Only the outer level is resolved eagerly (a single
/// bounded scan); `(s, t)` descent happens one pair at a time as the
/// caller advances. Backs `Index::enumerate`.
pub struct EnumerateIter<'i, 'h, S> {
    _guard: ReadGuard<'i>,
    p_pinned: bool,
    s_pinned: bool,
    c_s: Constraint<Term>,
    c_t: Constraint<Term>,
    outer: std::vec::IntoIter<(Term, Middle<'h, S>)>,
    current_p: Option<Term>,
    middles: std::vec::IntoIter<(Term, Leaf<'h, S>)>,
    current_s: Option<Term>,
    leaves: std::vec::IntoIter<Term>,
}

impl<'i, 'h, S> Iterator for EnumerateIter<'i, 'h, S>
where
    S: Read + Write + Seek,
{
    type Item = Result<Vec<Term>>;

    fn next(&mut self) -> Option<Result<Vec<Term>>> {
        loop {
            if let Some(t) = self.leaves.next() {
                let row = match (self.p_pinned, self.s_pinned) {
                    (true, true) => vec![t],
                    (true, false) => vec![self.current_s.clone().expect("set alongside leaves"), t],
                    _ => vec![
                        self.current_p.clone().expect("set alongside leaves"),
                        self.current_s.clone().expect("set alongside leaves"),
                        t,
                    ],
                };
                return Some(Ok(row));
            }
            if let Some((s, leaf)) = self.middles.next() {
                match leaf.constrain_by(&self.c_t) {
                    Ok(terms) => {
                        self.current_s = Some(s);
                        self.leaves = terms.into_iter();
                        continue;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            let (p, middle) = self.outer.next()?;
            match middle.constrain_by(&self.c_s) {
                Ok(entries) => {
                    self.current_p = Some(p);
                    self.middles = entries.into_iter();
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build(heap: &Heap<Cursor<Vec<u8>>>) -> Index<'_, Cursor<Vec<u8>>> {
        Index::create(heap).unwrap()
    }

    fn rows(idx: &Index<'_, Cursor<Vec<u8>>>, c_p: &Constraint<Term>, c_s: &Constraint<Term>, c_t: &Constraint<Term>) -> Vec<Vec<Term>> {
        idx.enumerate(c_p, c_s, c_t).unwrap().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn add_contains_remove_roundtrip() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let idx = build(&heap);
        idx.add("a", "p", "1").unwrap();
        assert!(idx.contains_pst("a", "p", "1").unwrap());
        idx.remove("a", "p", "1").unwrap();
        assert!(!idx.contains_pst("a", "p", "1").unwrap());
    }

    #[test]
    fn add_is_idempotent() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let idx = build(&heap);
        idx.add("a", "p", "1").unwrap();
        idx.add("a", "p", "1").unwrap();
        let all = rows(&idx, &Constraint::Any, &Constraint::Any, &Constraint::Any);
        assert_eq!(all, vec![vec!["a".to_string(), "p".to_string(), "1".to_string()]]);
    }

    #[test]
    fn enumerate_seed_scenario() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let idx = build(&heap);
        idx.add("a", "p", "1").unwrap();
        idx.add("a", "p", "2").unwrap();
        idx.add("a", "q", "1").unwrap();
        idx.add("b", "p", "1").unwrap();

        let all = rows(&idx, &Constraint::Any, &Constraint::Any, &Constraint::Any);
        assert_eq!(
            all,
            vec![
                vec!["a".to_string(), "p".to_string(), "1".to_string()],
                vec!["a".to_string(), "p".to_string(), "2".to_string()],
                vec!["a".to_string(), "q".to_string(), "1".to_string()],
                vec!["b".to_string(), "p".to_string(), "1".to_string()],
            ]
        );

        let by_a = rows(&idx, &Constraint::specific("a".to_string()), &Constraint::Any, &Constraint::Any);
        assert_eq!(
            by_a,
            vec![
                vec!["p".to_string(), "1".to_string()],
                vec!["p".to_string(), "2".to_string()],
                vec!["q".to_string(), "1".to_string()],
            ]
        );

        idx.remove("a", "p", "").unwrap();
        let after = rows(&idx, &Constraint::Any, &Constraint::Any, &Constraint::Any);
        assert_eq!(
            after,
            vec![
                vec!["a".to_string(), "q".to_string(), "1".to_string()],
                vec!["b".to_string(), "p".to_string(), "1".to_string()],
            ]
        );
        assert!(!idx.contains_ps("a", "p").unwrap());
    }

    #[test]
    fn remove_leaves_empty_intermediate_but_skips_it_on_enumerate() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let idx = build(&heap);
        idx.add("a", "p", "1").unwrap();
        idx.remove("a", "p", "1").unwrap();
        assert!(idx.contains_p("a").unwrap(), "intermediate container survives an empty-leaf removal");
        assert!(!idx.contains_ps("a", "p").unwrap());
        let result = rows(&idx, &Constraint::Any, &Constraint::Any, &Constraint::Any);
        assert!(result.is_empty());
    }

    #[test]
    fn views_union_matches_enumerate_terms() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let idx = build(&heap);
        idx.add("a", "p", "1").unwrap();
        idx.add("a", "q", "2").unwrap();
        idx.add("b", "p", "3").unwrap();

        let mut terms: Vec<String> =
            idx.views(&Constraint::Any, &Constraint::Any, &Constraint::Any).unwrap().collect::<Result<Vec<_>>>().unwrap();
        terms.sort();
        assert_eq!(terms, vec!["1".to_string(), "2".to_string(), "3".to_string()]);

        let pinned: Vec<String> = idx.view("a", "p", &Constraint::Any).unwrap().collect();
        assert_eq!(pinned, vec!["1".to_string()]);
    }

    #[test]
    fn reopen_through_cells_finds_same_data() {
        let heap = Heap::create(Cursor::new(Vec::new()), 1 << 16).unwrap();
        let (term_cell, outer_cell) = {
            let idx = build(&heap);
            idx.add("a", "p", "1").unwrap();
            (idx.term_cell(), idx.outer_cell())
        };
        let reopened = Index::open(&heap, term_cell, outer_cell);
        assert!(reopened.contains_pst("a", "p", "1").unwrap());
    }
}
