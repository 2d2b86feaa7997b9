//! `RwSpin` implements a reader/writer latch-and-spin guard, the same
//! busy-wait discipline the teacher crate uses to serialize concurrent
//! access to its in-memory index (`RWSpinlock`) without blocking the
//! calling thread on the OS scheduler for the (usually short) critical
//! sections involved.
//!
//! A reader may proceed as soon as no writer holds the latch; any number
//! of readers may hold it concurrently. A writer may proceed only once no
//! reader and no other writer holds it. Calling thread busy-waits (or
//! yields, if `spin` is false) while a conflicting holder is present.
//!
//! `RwSpin` itself carries no payload — like the teacher's `RWSpinlock` it
//! is a bare permission token. Callers pair it with their own protected
//! state and must not touch that state outside the matching guard's
//! lifetime; the type system does not enforce this pairing, only the
//! guard's RAII release does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const WRITER: usize = usize::MAX;

pub struct RwSpin {
    state: AtomicUsize,
    spin: bool,
}

impl RwSpin {
    pub fn new() -> RwSpin {
        RwSpin { state: AtomicUsize::new(0), spin: true }
    }

    /// If `spin` is false, a thread that cannot immediately acquire the
    /// latch yields to the scheduler between attempts instead of
    /// busy-waiting.
    pub fn set_spin(&mut self, spin: bool) {
        self.spin = spin;
    }

    pub fn read(&self) -> ReadGuard<'_> {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur != WRITER {
                let next = cur + 1;
                if self
                    .state
                    .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return ReadGuard { lock: self };
                }
            }
            self.wait();
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return WriteGuard { lock: self };
            }
            self.wait();
        }
    }

    fn wait(&self) {
        if self.spin {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }
}

impl Default for RwSpin {
    fn default() -> RwSpin {
        RwSpin::new()
    }
}

pub struct ReadGuard<'a> {
    lock: &'a RwSpin,
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a> {
    lock: &'a RwSpin,
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_readers_proceed() {
        let lock = Arc::new(RwSpin::new());
        let g1 = lock.read();
        let g2 = lock.read();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = RwSpin::new();
        let w = lock.write();
        drop(w);
        let r = lock.read();
        drop(r);
    }
}
