//! `Heap` is the variable-block allocator over an arbitrary seekable byte
//! stream that every other module in this crate is built on: a header at
//! offset zero, a singly linked list of named roots, and a chain of
//! contiguous blocks each carrying an 8-byte signed size word (positive
//! for allocated, negative for free) followed by its payload.
//!
//! Binary layout (little-endian, 8-byte words unless noted):
//!
//! ```text
//! [0]     total_size       i64
//! [8]     free_list_head   i64   (payload offset of first free block, 0 = empty)
//! [16]    root_list_head   i64   (payload offset of most recent root record, 0 = none)
//! [24..]  blocks: size_word(i64) payload(|size_word| bytes)
//!         free block payload:    next(i64) prev(i64) ...
//!         root record payload:   next_root(i64) referenced_offset(i64) name(utf8)
//! ```
//!
//! All offsets this module hands back to callers are *payload* offsets
//! (the byte right after a block's size word); a block's header lives at
//! `payload_offset - 8`.
//!
//! Grounded in the teacher crate's file-position bookkeeping in `robt.rs`
//! (fixed-offset header/footer fields read directly off a `fs::File`) and
//! its buffered-I/O helpers in `util.rs` (`read_buffer`, `try_convert_int`).

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::spinlock::RwSpin;

pub const HEADER_LEN: u64 = 24;
pub const MIN_CAPACITY: u64 = 48;
const MIN_ALLOC: u64 = 16;
/// A free block only splits if the remainder can itself hold a valid
/// free block: an 8-byte header plus a 16-byte `(next, prev)` payload.
const SPLIT_SLACK: u64 = 24;

fn read_i64<S: Read + Seek>(s: &mut S, pos: u64) -> Result<i64> {
    s.seek(SeekFrom::Start(pos))?;
    let mut buf = [0u8; 8];
    s.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn write_i64<S: Write + Seek>(s: &mut S, pos: u64, val: i64) -> Result<()> {
    s.seek(SeekFrom::Start(pos))?;
    s.write_all(&val.to_le_bytes())?;
    Ok(())
}

fn read_link<S: Read + Seek>(s: &mut S, payload: u64) -> Result<(i64, i64)> {
    let next = read_i64(s, payload)?;
    let prev = read_i64(s, payload + 8)?;
    Ok((next, prev))
}

fn write_link<S: Write + Seek>(s: &mut S, payload: u64, next: i64, prev: i64) -> Result<()> {
    write_i64(s, payload, next)?;
    write_i64(s, payload + 8, prev)?;
    Ok(())
}

fn read_bytes<S: Read + Seek>(s: &mut S, pos: u64, len: usize) -> Result<Vec<u8>> {
    s.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0u8; len];
    let n = s.read(&mut buf)?;
    if n != len {
        return Err(Error::PartialRead { what: "heap block".into(), want: len, got: n });
    }
    Ok(buf)
}

fn write_bytes<S: Write + Seek>(s: &mut S, pos: u64, bytes: &[u8]) -> Result<()> {
    s.seek(SeekFrom::Start(pos))?;
    s.write_all(bytes)?;
    Ok(())
}

/// Splice `new` into the free list at the position currently occupied by
/// `old`, or remove `old` outright when `new == 0`. Reads `old`'s links
/// live at call time, so repeated calls (as in forward coalescing) see
/// each other's edits rather than a stale snapshot.
fn replace_free_node<S: Read + Write + Seek>(s: &mut S, old: u64, new: u64) -> Result<()> {
    let (next, prev) = read_link(s, old)?;
    if new != 0 {
        write_link(s, new, next, prev)?;
    }
    if prev != 0 {
        write_i64(s, prev as u64, new as i64)?;
    } else {
        write_i64(s, 8, new as i64)?;
    }
    if next != 0 {
        write_i64(s, next as u64 + 8, new as i64)?;
    }
    Ok(())
}

/// Push `payload` onto the head of the free list (LIFO).
fn insert_free_head<S: Read + Write + Seek>(s: &mut S, payload: u64) -> Result<()> {
    let old_head = read_i64(s, 8)?;
    write_link(s, payload, old_head, 0)?;
    if old_head != 0 {
        write_i64(s, old_head as u64 + 8, payload as i64)?;
    }
    write_i64(s, 8, payload as i64)?;
    Ok(())
}

/// Byte-addressable variable-block heap over any `Read + Write + Seek`
/// stream. Safe to share across threads behind an `Arc`: structural
/// operations take `latch`, actual stream bytes are serialized through
/// `stream`. See the module doc for why both exist.
pub struct Heap<S> {
    latch: RwSpin,
    stream: Mutex<S>,
    validate: bool,
}

impl<S: Read + Write + Seek> Heap<S> {
    /// Initialize a fresh heap on an empty stream with `capacity` bytes
    /// of logical address space.
    pub fn create(stream: S, capacity: u64) -> Result<Heap<S>> {
        if capacity < MIN_CAPACITY {
            return Err(Error::ValidationFail(format!(
                "capacity {} below minimum {}",
                capacity, MIN_CAPACITY
            )));
        }
        let heap = Heap { latch: RwSpin::new(), stream: Mutex::new(stream), validate: false };
        {
            let mut s = heap.stream.lock().unwrap();
            write_i64(&mut *s, 0, capacity as i64)?;
            write_i64(&mut *s, 8, (HEADER_LEN + 8) as i64)?;
            write_i64(&mut *s, 16, 0)?;
            let payload_len = capacity - HEADER_LEN - 8;
            write_i64(&mut *s, HEADER_LEN, -(payload_len as i64))?;
            write_link(&mut *s, HEADER_LEN + 8, 0, 0)?;
        }
        debug!("heap created: capacity={}", capacity);
        Ok(heap)
    }

    /// Reopen a heap from a stream previously initialized by `create`.
    /// All state besides `total_size` is recovered by walking blocks.
    pub fn open(stream: S) -> Result<Heap<S>> {
        let heap = Heap { latch: RwSpin::new(), stream: Mutex::new(stream), validate: false };
        let total = {
            let mut s = heap.stream.lock().unwrap();
            read_i64(&mut *s, 0)?
        };
        if total < MIN_CAPACITY as i64 {
            return Err(Error::ValidationFail("reopened stream has no valid heap header".into()));
        }
        debug!("heap reopened: capacity={}", total);
        Ok(heap)
    }

    /// Enable the post-mutation chain/free-list consistency check
    /// described in the spec's VALIDATE mode. Meant for tests and
    /// debug builds; it re-walks the whole block chain after every
    /// mutating call, so it is not free.
    pub fn set_validate(&mut self, validate: bool) {
        self.validate = validate;
    }

    fn total_locked(&self, s: &mut S) -> Result<u64> {
        Ok(read_i64(s, 0)? as u64)
    }

    pub fn alloc(&self, n: usize) -> Result<u64> {
        let _g = self.latch.write();
        let mut s = self.stream.lock().unwrap();
        let offset = self.alloc_locked(&mut *s, n)?;
        if self.validate {
            self.validate_locked(&mut *s)?;
        }
        Ok(offset)
    }

    fn alloc_locked(&self, s: &mut S, n: usize) -> Result<u64> {
        let n_req = std::cmp::max(n as u64, MIN_ALLOC);
        let mut cur = read_i64(s, 8)? as u64;
        loop {
            if cur == 0 {
                return Err(Error::OutOfMemory(n_req));
            }
            let bpos = cur - 8;
            let size_word = read_i64(s, bpos)?;
            if size_word >= 0 {
                return Err(Error::Corruption(format!(
                    "free list entry at {} points at an allocated block",
                    cur
                )));
            }
            let f = (-size_word) as u64;
            if f < n_req {
                let (next, _prev) = read_link(s, cur)?;
                cur = next as u64;
                continue;
            }
            if f >= n_req + SPLIT_SLACK {
                let tail_bpos = bpos + 8 + n_req;
                let tail_payload = tail_bpos + 8;
                let tail_len = f - n_req - 8;
                replace_free_node(s, cur, tail_payload)?;
                write_i64(s, tail_bpos, -(tail_len as i64))?;
                write_i64(s, bpos, n_req as i64)?;
            } else {
                replace_free_node(s, cur, 0)?;
                write_i64(s, bpos, f as i64)?;
            }
            return Ok(bpos + 8);
        }
    }

    pub fn free(&self, offset: u64) -> Result<()> {
        let _g = self.latch.write();
        let mut s = self.stream.lock().unwrap();
        self.free_locked(&mut *s, offset)?;
        if self.validate {
            self.validate_locked(&mut *s)?;
        }
        Ok(())
    }

    fn free_locked(&self, s: &mut S, offset: u64) -> Result<()> {
        if offset == 0 {
            return Err(Error::NullOffset);
        }
        let total = self.total_locked(s)?;
        let bpos = offset - 8;
        if bpos < HEADER_LEN || bpos >= total {
            return Err(Error::InvalidOffset(offset));
        }
        let size_word = read_i64(s, bpos)?;
        if size_word < 0 {
            return Err(Error::AlreadyFreed(offset));
        }
        let mut f = size_word as u64;
        write_i64(s, bpos, -(f as i64))?;
        insert_free_head(s, offset)?;

        loop {
            let neighbor_bpos = bpos + 8 + f;
            if neighbor_bpos + 8 > total {
                break;
            }
            let neighbor_size = read_i64(s, neighbor_bpos)?;
            if neighbor_size >= 0 {
                break;
            }
            let neighbor_f = (-neighbor_size) as u64;
            let neighbor_payload = neighbor_bpos + 8;
            replace_free_node(s, offset, 0)?;
            replace_free_node(s, neighbor_payload, 0)?;
            f += 8 + neighbor_f;
            write_i64(s, bpos, -(f as i64))?;
            insert_free_head(s, offset)?;
        }
        Ok(())
    }

    /// Walk the full block chain, merging every run of adjacent free
    /// blocks. `free()` only coalesces forward from the block it just
    /// freed, so under sustained mixed workloads a caller should call
    /// `gc()` periodically to collapse fragmentation `free()` alone
    /// cannot see (a freed block whose *lower*-offset neighbor is also
    /// free, with no merge yet performed between them).
    pub fn gc(&self) -> Result<()> {
        let _g = self.latch.write();
        let mut s = self.stream.lock().unwrap();
        let total = self.total_locked(&mut *s)?;
        let mut pos = HEADER_LEN;
        let mut merges = 0usize;
        while pos + 8 <= total {
            let w = read_i64(&mut *s, pos)?;
            if w < 0 {
                let mut f = (-w) as u64;
                loop {
                    let nb = pos + 8 + f;
                    if nb + 8 > total {
                        break;
                    }
                    let nw = read_i64(&mut *s, nb)?;
                    if nw >= 0 {
                        break;
                    }
                    let nf = (-nw) as u64;
                    replace_free_node(&mut *s, nb + 8, 0)?;
                    f += 8 + nf;
                    write_i64(&mut *s, pos, -(f as i64))?;
                    merges += 1;
                }
                pos += 8 + f;
            } else {
                pos += 8 + (w as u64);
            }
        }
        if merges > 0 {
            debug!("gc: merged {} adjacent free runs", merges);
        }
        Ok(())
    }

    pub fn get(&self, offset: u64) -> Result<Vec<u8>> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        let len = self.size_of_locked(&mut *s, offset)? as usize;
        read_bytes(&mut *s, offset, len)
    }

    pub fn set(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let _g = self.latch.write();
        let mut s = self.stream.lock().unwrap();
        let cap = self.size_of_locked(&mut *s, offset)? as usize;
        if bytes.len() > cap {
            return Err(Error::IndexOutOfRange { offset, len: bytes.len(), capacity: cap });
        }
        write_bytes(&mut *s, offset, bytes)
    }

    pub fn size_of(&self, offset: u64) -> Result<i64> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        self.size_of_locked(&mut *s, offset)
    }

    fn size_of_locked(&self, s: &mut S, offset: u64) -> Result<i64> {
        if offset == 0 {
            return Err(Error::NullOffset);
        }
        if !self.is_valid_locked(s, offset)? {
            return Err(Error::AlreadyFreed(offset));
        }
        let bpos = offset - 8;
        let w = read_i64(s, bpos)?;
        if w <= 0 {
            return Err(Error::Corruption(format!("size word at {} turned non-positive", offset)));
        }
        Ok(w)
    }

    pub fn is_valid(&self, offset: u64) -> bool {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        self.is_valid_locked(&mut *s, offset).unwrap_or(false)
    }

    fn is_valid_locked(&self, s: &mut S, offset: u64) -> Result<bool> {
        if offset == 0 {
            return Ok(false);
        }
        let total = self.total_locked(s)?;
        let bpos = offset - 8;
        if bpos < HEADER_LEN || bpos + 8 > total {
            return Ok(false);
        }
        Ok(read_i64(s, bpos)? > 0)
    }

    pub fn get_root(&self, name: &str) -> Result<u64> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        self.get_root_locked(&mut *s, name)
    }

    fn get_root_locked(&self, s: &mut S, name: &str) -> Result<u64> {
        let mut cur = read_i64(s, 16)?;
        while cur != 0 {
            let payload = cur as u64;
            let len = self.size_of_locked(s, payload)? as usize;
            let next_root = read_i64(s, payload)?;
            let referenced = read_i64(s, payload + 8)? as u64;
            let name_bytes = read_bytes(s, payload + 16, len - 16)?;
            if name_bytes == name.as_bytes() {
                return Ok(referenced);
            }
            cur = next_root;
        }
        Err(Error::KeyNotFound(name.to_string()))
    }

    pub fn set_root(&self, name: &str, offset: u64) -> Result<()> {
        let _g = self.latch.write();
        let mut s = self.stream.lock().unwrap();
        if self.get_root_locked(&mut *s, name).is_ok() {
            return Err(Error::DuplicateRoot(name.to_string()));
        }
        let name_bytes = name.as_bytes();
        let record_len = 16 + name_bytes.len();
        let record = self.alloc_locked(&mut *s, record_len)?;
        let old_head = read_i64(&mut *s, 16)?;
        write_i64(&mut *s, record, old_head)?;
        write_i64(&mut *s, record + 8, offset as i64)?;
        write_bytes(&mut *s, record + 16, name_bytes)?;
        write_i64(&mut *s, 16, record as i64)?;
        if self.validate {
            self.validate_locked(&mut *s)?;
        }
        debug!("root {:?} -> {}", name, offset);
        Ok(())
    }

    pub fn roots(&self) -> Result<Vec<(String, u64)>> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        let mut out = Vec::new();
        let mut cur = read_i64(&mut *s, 16)?;
        while cur != 0 {
            let payload = cur as u64;
            let len = self.size_of_locked(&mut *s, payload)? as usize;
            let next_root = read_i64(&mut *s, payload)?;
            let referenced = read_i64(&mut *s, payload + 8)? as u64;
            let name_bytes = read_bytes(&mut *s, payload + 16, len - 16)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|e| Error::DecodeFail(format!("root name: {}", e)))?;
            out.push((name, referenced));
            cur = next_root;
        }
        Ok(out)
    }

    /// `(free_block_count, used_block_count)` by one chain walk.
    fn block_counts(&self, s: &mut S) -> Result<(usize, usize)> {
        let total = self.total_locked(s)?;
        let mut pos = HEADER_LEN;
        let (mut free, mut used) = (0usize, 0usize);
        while pos + 8 <= total {
            let w = read_i64(s, pos)?;
            let len = w.unsigned_abs();
            if w < 0 {
                free += 1;
            } else {
                used += 1;
            }
            pos += 8 + len;
        }
        Ok((free, used))
    }

    pub fn count_free_blocks(&self) -> Result<usize> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        Ok(self.block_counts(&mut *s)?.0)
    }

    pub fn count_used_blocks(&self) -> Result<usize> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        Ok(self.block_counts(&mut *s)?.1)
    }

    /// `(used_bytes, free_bytes)` of payload space, not counting headers.
    pub fn footprint(&self) -> Result<(u64, u64)> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        let total = self.total_locked(&mut *s)?;
        let mut pos = HEADER_LEN;
        let (mut used, mut free) = (0u64, 0u64);
        while pos + 8 <= total {
            let w = read_i64(&mut *s, pos)?;
            let len = w.unsigned_abs();
            if w < 0 {
                free += len;
            } else {
                used += len;
            }
            pos += 8 + len;
        }
        Ok((used, free))
    }

    fn validate_locked(&self, s: &mut S) -> Result<()> {
        let total = self.total_locked(s)?;
        let mut pos = HEADER_LEN;
        let mut chain_free = 0usize;
        while pos + 8 <= total {
            let w = read_i64(s, pos)?;
            if w == 0 {
                return Err(Error::ValidationFail(format!("zero-size block at {}", pos)));
            }
            if w < 0 {
                chain_free += 1;
            }
            pos += 8 + w.unsigned_abs();
        }
        if pos != total {
            return Err(Error::ValidationFail(format!(
                "block chain ends at {}, expected {}",
                pos, total
            )));
        }
        let mut cur = read_i64(s, 8)?;
        let mut list_free = 0usize;
        while cur != 0 {
            list_free += 1;
            let (next, _prev) = read_link(s, cur as u64)?;
            cur = next;
        }
        if list_free != chain_free {
            warn!("heap validation failed: free-list={} chain={}", list_free, chain_free);
            return Err(Error::ValidationFail(format!(
                "free-list walk found {} blocks, chain walk found {}",
                list_free, chain_free
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        self.validate_locked(&mut *s)
    }

    /// Render the block chain as a diagnostic string: offset, size,
    /// alive/free. Optional by design (see the source's empty `Dump`
    /// method); used only by tests and manual debugging.
    pub fn dump(&self) -> Result<String> {
        let _g = self.latch.read();
        let mut s = self.stream.lock().unwrap();
        let total = self.total_locked(&mut *s)?;
        let mut pos = HEADER_LEN;
        let mut out = String::new();
        while pos + 8 <= total {
            let w = read_i64(&mut *s, pos)?;
            let len = w.unsigned_abs();
            out.push_str(&format!(
                "{:>8} {:>8} {}\n",
                pos + 8,
                len,
                if w < 0 { "free" } else { "used" }
            ));
            pos += 8 + len;
        }
        Ok(out)
    }

    pub fn reader(&self, offset: u64) -> Result<HeapCursor<'_, S>> {
        let len = self.size_of(offset)? as u64;
        Ok(HeapCursor { heap: self, offset, len, pos: 0 })
    }

    pub fn writer(&self, offset: u64) -> Result<HeapCursor<'_, S>> {
        let len = self.size_of(offset)? as u64;
        Ok(HeapCursor { heap: self, offset, len, pos: 0 })
    }
}

/// A bounds-checked sub-stream over a single block's payload. Does not
/// hold the heap's latch across its lifetime; a caller iterating with
/// several cursors in the same logical operation must take its own lock
/// around them (the index does exactly this).
pub struct HeapCursor<'h, S> {
    heap: &'h Heap<S>,
    offset: u64,
    len: u64,
    pos: u64,
}

impl<'h, S: Read + Write + Seek> Read for HeapCursor<'h, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = (self.len - self.pos) as usize;
        let n = std::cmp::min(buf.len(), remaining);
        if n == 0 {
            return Ok(0);
        }
        let mut s = self.heap.stream.lock().unwrap();
        s.seek(SeekFrom::Start(self.offset + self.pos))?;
        let n = s.read(&mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'h, S: Read + Write + Seek> Write for HeapCursor<'h, S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let remaining = (self.len - self.pos) as usize;
        if buf.len() > remaining {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "write would exceed block bounds",
            ));
        }
        let mut s = self.heap.stream.lock().unwrap();
        s.seek(SeekFrom::Start(self.offset + self.pos))?;
        s.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'h, S> Seek for HeapCursor<'h, S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.len as i64 + d,
        };
        if new_pos < 0 || new_pos as u64 > self.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek outside block bounds",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}
