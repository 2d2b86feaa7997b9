//! `tristore-core` is the storage and indexing core of an RDF-style triple
//! store: a variable-block heap allocator over an arbitrary seekable byte
//! stream, a typed allocator layer that lifts raw offsets into persisted
//! logical objects, an AA-tree-backed ordered map/set, and a three-level
//! ordered index over `(primary, secondary, ternary)` term triples.
//!
//! Serialization formats, relational algebra over materialized rows, and
//! term/namespace parsing are external collaborators that consume this
//! crate through `Index`'s public contract; none of that lives here.

mod aatree;
mod codec;
mod constraint;
mod container;
mod env;
mod error;
mod heap;
mod index;
mod spinlock;
mod view;

pub mod alloc;

pub use constraint::Constraint;
pub use container::{SortedMap, SortedSet};
pub use env::{Env, PolyInMemory, SingleInFile, SingleInMemory, Strategy};
pub use error::{Error, Result};
pub use heap::Heap;
pub use index::{EnumerateIter, Index, Term};
pub use spinlock::RwSpin;
pub use view::{ConstrainedView, UnionView};

pub use alloc::{Allocator, Counted, NullAllocator, NullValue, ReferenceAllocator, SingletonAllocator};
pub use codec::Codec;
