//! Seqlock publication of immutable values.
//!
//! One writer brackets each publish with two increments of a shared
//! sequence counter (odd while a write is in flight, even otherwise).
//! Readers sample the counter, copy the value, and sample again; a copy is
//! only returned if both samples are equal and even.
//!
//! ```text
//! writer:  seq+1 (odd) -> swap value -> fence -> seq+1 (even)
//! reader:  s1 (even?) -> copy value -> fence -> s2 == s1 ?
//! ```
//!
//! The value slot is an epoch-managed atomic pointer: a published value is
//! never mutated, only replaced, and a replaced value is reclaimed once no
//! reader can still be copying it. The writer never waits on readers.

use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// Attempts a reader makes before reporting "no value this tick".
pub const READ_ATTEMPTS: usize = 3;

struct Shared<T> {
    sequence: CachePadded<AtomicU64>,
    slot: Atomic<T>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: we hold the last reference, so no reader is pinned on
        // this slot and no other thread can observe it.
        unsafe {
            let guard = epoch::unprotected();
            let current = self.slot.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

/// Creates a connected writer/reader pair with nothing published yet.
pub fn seqlock<T: Send + Sync + 'static>() -> (SeqWriter<T>, SeqReader<T>) {
    let shared = Arc::new(Shared {
        sequence: CachePadded::new(AtomicU64::new(0)),
        slot: Atomic::null(),
    });
    (
        SeqWriter {
            shared: Arc::clone(&shared),
        },
        SeqReader { shared },
    )
}

/// The single writer role. Not `Clone`.
pub struct SeqWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> SeqWriter<T> {
    /// Publishes a new value.
    pub fn publish(&mut self, value: T) {
        self.begin().commit(value);
    }

    /// Opens a write: the sequence becomes odd until the guard is dropped.
    ///
    /// Dropping the guard without committing leaves the previous value in
    /// place.
    pub fn begin(&mut self) -> WriteGuard<'_, T> {
        self.shared.sequence.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        WriteGuard {
            shared: &self.shared,
        }
    }

    /// Creates another reader.
    pub fn reader(&self) -> SeqReader<T> {
        SeqReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current sequence value (even when idle).
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::Acquire)
    }
}

/// An in-flight write.
pub struct WriteGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<'a, T: Send + Sync + 'static> WriteGuard<'a, T> {
    /// Swaps in the new value and closes the write.
    pub fn commit(self, value: T) {
        let guard = epoch::pin();
        let old = self
            .shared
            .slot
            .swap(Owned::new(value), Ordering::AcqRel, &guard);
        if !old.is_null() {
            // SAFETY: `old` is unreachable from the slot now; readers that
            // loaded it before the swap are pinned and keep it alive.
            unsafe { guard.defer_destroy(old) };
        }
        // `self` drops here and closes the write
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        fence(Ordering::SeqCst);
        self.shared.sequence.fetch_add(1, Ordering::Release);
    }
}

/// A reader handle. Cheap to clone; never blocks the writer.
pub struct SeqReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SeqReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> SeqReader<T> {
    /// Copies the latest value.
    ///
    /// Returns `None` if nothing has been published yet or if every attempt
    /// overlapped a write. Both are normal conditions: skip this tick.
    pub fn try_read(&self) -> Option<T>
    where
        T: Clone,
    {
        self.try_read_with(T::clone)
    }

    /// Applies `f` to a consistent view of the latest value.
    ///
    /// `f` may run more than once; only the result of a validated attempt
    /// is returned.
    pub fn try_read_with<U>(&self, f: impl Fn(&T) -> U) -> Option<U> {
        for _ in 0..READ_ATTEMPTS {
            let before = self.shared.sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let guard = epoch::pin();
            let current = self.shared.slot.load(Ordering::Acquire, &guard);
            // SAFETY: loaded under `guard`, so the value cannot be reclaimed
            // before the guard is dropped.
            let copy = unsafe { current.as_ref() }.map(&f);

            fence(Ordering::SeqCst);
            let after = self.shared.sequence.load(Ordering::Acquire);
            if before == after {
                return copy;
            }
        }
        None
    }

    /// Current sequence value.
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::Acquire)
    }
}
