//! `Env` maps `(type_tag, optional_name)` to a root offset inside a heap
//! supplied by a `Strategy`. Three strategies compose the same `Heap`
//! type onto different lifetimes and storage media: a fresh heap per
//! lookup, one shared in-memory heap, or one shared file-backed heap
//! that reopens an existing file rather than recreating it.
//!
//! Grounded in the teacher's `robt::Config`/file-path construction
//! (`new`, `to_type`, `dir_file`) for the "derive a concrete file from a
//! name, create if absent, open if present" discipline, generalized
//! from ROBT's disk-btree file naming to this crate's heap-per-strategy
//! roots.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;

use crate::error::Result;
use crate::heap::Heap;

fn root_key(type_tag: &str, name: Option<&str>) -> String {
    match name {
        Some(n) => format!("{}:{}", type_tag, n),
        None => type_tag.to_string(),
    }
}

pub trait Strategy {
    type Stream: Read + Write + Seek;

    fn heap(&self) -> Result<Rc<Heap<Self::Stream>>>;

    /// Discard the backing storage: a no-op for in-memory strategies,
    /// a file delete for `SingleInFile`. Used by tests to reset state
    /// between runs without leaking heap handles.
    fn remove(&self) -> Result<()>;
}

/// Every lookup produces a brand new in-memory heap; containers built
/// through this strategy never share address space with each other.
pub struct PolyInMemory {
    capacity: u64,
}

impl PolyInMemory {
    pub fn new(capacity: u64) -> Self {
        PolyInMemory { capacity }
    }
}

impl Strategy for PolyInMemory {
    type Stream = Cursor<Vec<u8>>;

    fn heap(&self) -> Result<Rc<Heap<Cursor<Vec<u8>>>>> {
        Ok(Rc::new(Heap::create(Cursor::new(Vec::new()), self.capacity)?))
    }

    fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// One shared in-memory heap, created lazily on first use.
pub struct SingleInMemory {
    capacity: u64,
    heap: RefCell<Option<Rc<Heap<Cursor<Vec<u8>>>>>>,
}

impl SingleInMemory {
    pub fn new(capacity: u64) -> Self {
        SingleInMemory { capacity, heap: RefCell::new(None) }
    }
}

impl Strategy for SingleInMemory {
    type Stream = Cursor<Vec<u8>>;

    fn heap(&self) -> Result<Rc<Heap<Cursor<Vec<u8>>>>> {
        let mut slot = self.heap.borrow_mut();
        if slot.is_none() {
            *slot = Some(Rc::new(Heap::create(Cursor::new(Vec::new()), self.capacity)?));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    fn remove(&self) -> Result<()> {
        *self.heap.borrow_mut() = None;
        Ok(())
    }
}

/// One shared heap backed by a file at `path`, created lazily: if the
/// file is absent or empty, a fresh heap of `capacity` bytes is written;
/// otherwise the existing file is reopened by reading its header.
pub struct SingleInFile {
    capacity: u64,
    path: PathBuf,
    heap: RefCell<Option<Rc<Heap<File>>>>,
}

impl SingleInFile {
    pub fn new<P: AsRef<Path>>(capacity: u64, path: P) -> Self {
        SingleInFile { capacity, path: path.as_ref().to_path_buf(), heap: RefCell::new(None) }
    }
}

impl Strategy for SingleInFile {
    type Stream = File;

    fn heap(&self) -> Result<Rc<Heap<File>>> {
        let mut slot = self.heap.borrow_mut();
        if slot.is_none() {
            let exists = self.path.metadata().map(|m| m.len() > 0).unwrap_or(false);
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
            let heap = if exists {
                info!("reopening heap at {:?}", self.path);
                Heap::open(file)?
            } else {
                info!("creating heap at {:?} (capacity {})", self.path, self.capacity);
                Heap::create(file, self.capacity)?
            };
            *slot = Some(Rc::new(heap));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    fn remove(&self) -> Result<()> {
        *self.heap.borrow_mut() = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

pub struct Env<St: Strategy> {
    strategy: St,
}

impl<St: Strategy> Env<St> {
    pub fn new(strategy: St) -> Self {
        Env { strategy }
    }

    pub fn heap(&self) -> Result<Rc<Heap<St::Stream>>> {
        self.strategy.heap()
    }

    pub fn get_root(&self, type_tag: &str, name: Option<&str>) -> Result<u64> {
        self.heap()?.get_root(&root_key(type_tag, name))
    }

    pub fn set_root(&self, type_tag: &str, name: Option<&str>, offset: u64) -> Result<()> {
        self.heap()?.set_root(&root_key(type_tag, name), offset)
    }

    pub fn remove(&self) -> Result<()> {
        self.strategy.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poly_in_memory_is_fresh_each_time() {
        let env = Env::new(PolyInMemory::new(256));
        let a = env.heap().unwrap();
        a.set_root("x", 16).unwrap();
        let b = env.heap().unwrap();
        assert!(b.get_root("x").is_err());
    }

    #[test]
    fn single_in_memory_shares_across_lookups() {
        let env = Env::new(SingleInMemory::new(256));
        env.set_root("x", None, 16).unwrap();
        assert_eq!(env.get_root("x", None).unwrap(), 16);
    }

    #[test]
    fn single_in_file_reopens_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.bin");
        {
            let env = Env::new(SingleInFile::new(4096, &path));
            env.set_root("x", Some("a"), 16).unwrap();
        }
        let env2 = Env::new(SingleInFile::new(4096, &path));
        assert_eq!(env2.get_root("x", Some("a")).unwrap(), 16);
    }

    #[test]
    fn single_in_file_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("heap.bin");
        let env = Env::new(SingleInFile::new(4096, &path));
        env.set_root("x", None, 16).unwrap();
        assert!(path.exists());
        assert_eq!(env.get_root("x", None).unwrap(), 16);
    }

    #[test]
    fn remove_deletes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.bin");
        let env = Env::new(SingleInFile::new(4096, &path));
        env.heap().unwrap();
        assert!(path.exists());
        env.remove().unwrap();
        assert!(!path.exists());
    }
}
