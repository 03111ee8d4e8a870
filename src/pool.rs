use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex, MutexGuard,
    },
};

use crate::buffer::{AllocError, BufferTriple};

/// Number of slots in every pool. Two is what makes the pipeline
/// double-buffered: one batch in flight on each side of the exchange.
pub const SLOTS: usize = 2;

/// A bounded ring of two [`BufferTriple`] slots coordinating exactly one
/// producer with exactly one consumer under blocking backpressure.
///
/// The filled-slot count lives under the pool mutex; the read and write
/// positions are plain atomics because each is only ever advanced by its
/// single owning side. Slot contents are reached through raw pointers
/// whose validity rests on the exchange protocol: a producer writes the
/// write slot only while it is unpublished (`count < SLOTS` observed
/// under the lock), a consumer reads the read slot only after the
/// producer advanced past it (`count > 0`). The pool validates none of
/// this; callers must pair their advances.
pub struct BufferPool {
    slots: [Box<UnsafeCell<BufferTriple>>; SLOTS],
    count: Mutex<usize>,
    non_empty: Condvar,
    non_full: Condvar,
    read_idx: AtomicUsize,
    write_idx: AtomicUsize,
}

// Safety: slot contents are only accessed per the producer/consumer
// protocol above, which hands each triple to at most one side at a time.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(
        data_len: usize,
        target_len: usize,
        meta_len: Option<usize>,
        pinned: bool,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            slots: [
                Box::new(UnsafeCell::new(BufferTriple::new(data_len, target_len, meta_len, pinned)?)),
                Box::new(UnsafeCell::new(BufferTriple::new(data_len, target_len, meta_len, pinned)?)),
            ],
            count: Mutex::new(0),
            non_empty: Condvar::new(),
            non_full: Condvar::new(),
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
        })
    }

    /// Acquires the pool mutex, yielding the filled-slot count.
    pub fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap()
    }

    /// Non-blocking variant for shutdown paths: the stop protocol must
    /// keep signalling even while the manager holds the pool mutex
    /// across a whole batch.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, usize>> {
        self.count.try_lock().ok()
    }

    pub fn full(count: usize) -> bool {
        count >= SLOTS
    }

    pub fn empty(count: usize) -> bool {
        count == 0
    }

    /// One blocking wait on the non-full condition. Callers loop: the
    /// wakeup may be spurious or raced away.
    pub fn wait_non_full<'a>(&self, guard: MutexGuard<'a, usize>) -> MutexGuard<'a, usize> {
        self.non_full.wait(guard).unwrap()
    }

    /// One blocking wait on the non-empty condition.
    pub fn wait_non_empty<'a>(&self, guard: MutexGuard<'a, usize>) -> MutexGuard<'a, usize> {
        self.non_empty.wait(guard).unwrap()
    }

    pub fn signal_non_empty(&self) {
        self.non_empty.notify_one();
    }

    pub fn signal_non_full(&self) {
        self.non_full.notify_one();
    }

    /// Shutdown-path variants: wake every waiter on the condition so a
    /// parked thread can observe its stop flag.
    pub fn broadcast_non_empty(&self) {
        self.non_empty.notify_all();
    }

    pub fn broadcast_non_full(&self) {
        self.non_full.notify_all();
    }

    /// Publishes the write slot. Must be called with the pool mutex held.
    pub fn advance_write(&self, count: &mut usize) {
        let idx = self.write_idx.load(Ordering::Relaxed);
        self.write_idx.store((idx + 1) % SLOTS, Ordering::Release);
        *count += 1;
    }

    /// Releases the read slot back to the producer. Must be called with
    /// the pool mutex held.
    pub fn advance_read(&self, count: &mut usize) {
        let idx = self.read_idx.load(Ordering::Relaxed);
        self.read_idx.store((idx + 1) % SLOTS, Ordering::Release);
        *count -= 1;
    }

    /// Current write slot.
    ///
    /// # Safety
    /// The caller must be the pool's single producer and must have
    /// observed the pool non-full under the lock; the returned triple is
    /// exclusively theirs until `advance_write` publishes it.
    pub unsafe fn write_slot(&self) -> *mut BufferTriple {
        self.slots[self.write_idx.load(Ordering::Acquire)].get()
    }

    /// Current read slot.
    ///
    /// # Safety
    /// The caller must be the pool's single consumer and must have
    /// observed the pool non-empty under the lock; the triple stays
    /// valid until they call `advance_read`.
    pub unsafe fn read_slot(&self) -> *const BufferTriple {
        self.slots[self.read_idx.load(Ordering::Acquire)].get()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn tiny_pool() -> BufferPool {
        BufferPool::new(8, 4, Some(4), false).unwrap()
    }

    #[test]
    fn count_tracks_paired_advances() {
        let pool = tiny_pool();

        let mut count = pool.lock();
        assert!(BufferPool::empty(*count));

        pool.advance_write(&mut count);
        pool.advance_write(&mut count);
        assert!(BufferPool::full(*count));

        pool.advance_read(&mut count);
        assert_eq!(*count, 1);
        pool.advance_read(&mut count);
        assert!(BufferPool::empty(*count));
    }

    #[test]
    fn slots_alternate() {
        let pool = tiny_pool();

        let first = unsafe { pool.write_slot() };
        {
            let mut count = pool.lock();
            pool.advance_write(&mut count);
        }
        let second = unsafe { pool.write_slot() };
        assert_ne!(first, second);

        {
            let mut count = pool.lock();
            pool.advance_write(&mut count);
        }
        assert_eq!(first, unsafe { pool.write_slot() });
    }

    #[test]
    fn producer_and_consumer_exchange_in_order() {
        let pool = Arc::new(tiny_pool());
        let batches = 64usize;

        let producer = {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..batches {
                    let mut count = pool.lock();
                    while BufferPool::full(*count) {
                        count = pool.wait_non_full(count);
                    }
                    let slot = unsafe { &mut *pool.write_slot() };
                    slot.data.reset();
                    slot.data.push_item(&[i as u8]);
                    pool.advance_write(&mut count);
                    drop(count);
                    pool.signal_non_empty();
                }
            })
        };

        let mut seen = Vec::new();
        for _ in 0..batches {
            let mut count = pool.lock();
            while BufferPool::empty(*count) {
                count = pool.wait_non_empty(count);
            }
            let slot = unsafe { &*pool.read_slot() };
            seen.push(slot.data.item(0).unwrap()[0]);
            pool.advance_read(&mut count);
            drop(count);
            pool.signal_non_full();
        }

        producer.join().unwrap();
        let expected = (0..batches).map(|i| i as u8).collect::<Vec<_>>();
        assert_eq!(seen, expected);
    }
}
