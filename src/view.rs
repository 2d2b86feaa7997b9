//! `ConstrainedView` and `UnionView` are the cursor types `Index::view`
//! and `Index::views` hand back. Both hold the `Index`'s read guard for
//! their own lifetime (released on `Drop`), so a writer cannot mutate
//! the index out from under a caller still mid-iteration: this is what
//! distinguishes them from a plain `Vec` returned under a lock that is
//! already gone by the time the caller looks at it.
//!
//! `UnionView` pulls its next group of terms lazily, one `(p, s)` pair at
//! a time, from a caller-supplied `groups` source instead of expanding
//! every pair up front — `Index::views` feeds it a source that performs
//! the next level of `constrain_by` only when the current group is
//! exhausted.
//!
//! Grounded in the teacher's `llrb.rs` `Iter`/`Range` structs, which
//! carry their own `_latch` guard alongside a `paths` descent stack so
//! the read lock lives exactly as long as the returned iterator does.

use crate::error::Result;
use crate::spinlock::ReadGuard;

/// A cursor over one container's already-resolved entries, holding the
/// index's read guard alive until the caller drops it.
pub struct ConstrainedView<'i, T> {
    _guard: ReadGuard<'i>,
    items: std::vec::IntoIter<T>,
}

impl<'i, T> ConstrainedView<'i, T> {
    pub fn new(guard: ReadGuard<'i>, items: Vec<T>) -> Self {
        ConstrainedView { _guard: guard, items: items.into_iter() }
    }
}

impl<'i, T> Iterator for ConstrainedView<'i, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

/// A cursor concatenating however many `(p, s)` groups match a query,
/// each group's terms fetched only once the caller has exhausted the
/// previous one.
pub struct UnionView<'i, T> {
    _guard: ReadGuard<'i>,
    groups: Box<dyn Iterator<Item = Result<Vec<T>>> + 'i>,
    current: std::vec::IntoIter<T>,
}

impl<'i, T> UnionView<'i, T> {
    pub fn new(guard: ReadGuard<'i>, groups: impl Iterator<Item = Result<Vec<T>>> + 'i) -> Self {
        UnionView { _guard: guard, groups: Box::new(groups), current: Vec::new().into_iter() }
    }
}

impl<'i, T> Iterator for UnionView<'i, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(t) = self.current.next() {
                return Some(Ok(t));
            }
            match self.groups.next()? {
                Ok(group) => self.current = group.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::RwSpin;

    #[test]
    fn constrained_view_yields_in_order_and_releases_guard_on_drop() {
        let lock = RwSpin::new();
        {
            let v = ConstrainedView::new(lock.read(), vec![1, 2, 3]);
            assert_eq!(v.collect::<Vec<_>>(), vec![1, 2, 3]);
        }
        let w = lock.write();
        drop(w);
    }

    #[test]
    fn union_view_concatenates_lazily_in_order() {
        let lock = RwSpin::new();
        let groups: Vec<Result<Vec<i64>>> = vec![Ok(vec![1, 2]), Ok(vec![]), Ok(vec![3])];
        let u = UnionView::new(lock.read(), groups.into_iter());
        let got: Result<Vec<i64>> = u.collect();
        assert_eq!(got.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn union_view_surfaces_a_group_error_without_panicking() {
        use crate::error::Error;

        let lock = RwSpin::new();
        let groups: Vec<Result<Vec<i64>>> = vec![Ok(vec![1]), Err(Error::NullOffset), Ok(vec![2])];
        let mut u = UnionView::new(lock.read(), groups.into_iter());
        assert_eq!(u.next().unwrap().unwrap(), 1);
        assert!(u.next().unwrap().is_err());
    }
}
