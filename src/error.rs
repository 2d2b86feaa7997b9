//! Error type shared by every fallible operation in this crate.
//!
//! Mirrors the flat, single-enum discipline the teacher crate threads through
//! its heap, tree and WAL modules: one `Error`, one `Result<T>` alias, no
//! per-module error types, recoverable conditions returned rather than
//! panicked on.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// `Heap::alloc` walked the whole free list without finding a fit.
    OutOfMemory(u64),
    /// An operation was called with offset zero.
    NullOffset,
    /// `size_of` found an offset outside the block area, or a size word
    /// that cannot be reconciled with the stream length.
    InvalidOffset(u64),
    /// The offset was once live but has already been passed to `free`.
    AlreadyFreed(u64),
    /// `set` was asked to write more bytes than the block can hold.
    IndexOutOfRange { offset: u64, len: usize, capacity: usize },
    /// A reference allocator has no constructor registered for this type.
    MissingConstructor(String),
    /// A reference allocator was asked to persist a value that is not
    /// itself a heap-backed object.
    InvalidCast(String),
    /// `set_root` was called with a name that already has a root.
    DuplicateRoot(String),
    /// No root is registered under this name.
    KeyNotFound(String),
    /// A container or file name failed validation.
    InvalidFile(String),
    /// A structural or block-chain invariant was violated; fatal.
    ValidationFail(String),
    /// `set`/block-chain validation detected torn I/O.
    PartialWrite { what: String, want: usize, got: usize },
    PartialRead { what: String, want: usize, got: usize },
    /// A codec failed to reconstruct a value from its bytes.
    DecodeFail(String),
    /// Heap corruption: a live invariant no longer holds. Fatal, no
    /// recovery is attempted.
    Corruption(String),
    /// Propagated I/O failure from the backing stream.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory(n) => write!(f, "out of memory: no free block fits {} bytes", n),
            Error::NullOffset => write!(f, "operation called with a null offset"),
            Error::InvalidOffset(o) => write!(f, "invalid offset {}", o),
            Error::AlreadyFreed(o) => write!(f, "offset {} was already freed", o),
            Error::IndexOutOfRange { offset, len, capacity } => write!(
                f,
                "write of {} bytes at offset {} exceeds block capacity {}",
                len, offset, capacity
            ),
            Error::MissingConstructor(t) => write!(f, "no deref constructor registered for {}", t),
            Error::InvalidCast(t) => write!(f, "{} is not a persisted object", t),
            Error::DuplicateRoot(name) => write!(f, "root {:?} already exists", name),
            Error::KeyNotFound(name) => write!(f, "no root named {:?}", name),
            Error::InvalidFile(path) => write!(f, "invalid file: {}", path),
            Error::ValidationFail(msg) => write!(f, "validation failed: {}", msg),
            Error::PartialWrite { what, want, got } => {
                write!(f, "partial write of {}: wanted {}, wrote {}", what, want, got)
            }
            Error::PartialRead { what, want, got } => {
                write!(f, "partial read of {}: wanted {}, read {}", what, want, got)
            }
            Error::DecodeFail(msg) => write!(f, "decode failed: {}", msg),
            Error::Corruption(msg) => write!(f, "heap corruption: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
