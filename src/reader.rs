use std::{
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use crate::{
    buffer::BufferTriple,
    pool::BufferPool,
};

/// Fatal archive failure reported by a [`Reader`].
#[derive(Debug)]
pub struct ReaderError {
    pub message: String,
}

impl ReaderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl Display for ReaderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not read data: {}", self.message)
    }
}

impl std::error::Error for ReaderError {}

/// The archive seam. One call fills one batch's worth of encoded items
/// into the triple's data and targets buffers (`meta` may be ignored).
/// The buffers are reset before each call and grow as items are pushed,
/// so grown capacity simply stays with the pool slot.
pub trait Reader: Send + 'static {
    fn read(&mut self, bufs: &mut BufferTriple) -> Result<(), ReaderError>;

    /// Repositions the reader to the beginning of the epoch.
    fn reset(&mut self);
}

struct ReadShared {
    done: AtomicBool,
    stopped: AtomicBool,
    failed: AtomicBool,
}

/// The pipeline's single producer: loops acquiring a writable read-pool
/// slot, invoking the reader, and publishing the slot.
pub struct ReadThread {
    shared: Arc<ReadShared>,
    pool: Arc<BufferPool>,
    handle: Option<JoinHandle<()>>,
}

impl ReadThread {
    pub fn start(pool: Arc<BufferPool>, reader: Arc<Mutex<dyn Reader>>) -> Self {
        let shared = Arc::new(ReadShared {
            done: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let handle = {
            let shared = shared.clone();
            let pool = pool.clone();
            std::thread::spawn(move || run(&shared, &pool, &reader))
        };

        Self { shared, pool, handle: Some(handle) }
    }

    /// Requests termination and wakes the producer if it is parked on
    /// backpressure. The thread keeps running until it observes the
    /// flag; pair with [`stopped`](Self::stopped) and [`join`](Self::join).
    pub fn stop(&self) {
        self.shared.done.store(true, Ordering::Release);
        self.pool.broadcast_non_full();
    }

    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn run(shared: &ReadShared, pool: &BufferPool, reader: &Mutex<dyn Reader>) {
    while !shared.done.load(Ordering::Acquire) {
        if let Err(err) = produce(shared, pool, reader) {
            eprintln!("{err}");
            shared.failed.store(true, Ordering::Release);
            break;
        }
    }

    shared.stopped.store(true, Ordering::Release);
}

fn produce(shared: &ReadShared, pool: &BufferPool, reader: &Mutex<dyn Reader>) -> Result<(), ReaderError> {
    let mut count = pool.lock();
    while BufferPool::full(*count) {
        count = pool.wait_non_full(count);
        if shared.done.load(Ordering::Acquire) {
            return Ok(());
        }
    }

    // Safety: single producer, slot observed non-full under the lock.
    let bufs = unsafe { &mut *pool.write_slot() };
    bufs.reset();
    reader.lock().unwrap().read(bufs)?;

    pool.advance_write(&mut count);
    drop(count);
    pool.signal_non_empty();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingReader {
        reads: usize,
        fail_at: Option<usize>,
    }

    impl Reader for CountingReader {
        fn read(&mut self, bufs: &mut BufferTriple) -> Result<(), ReaderError> {
            if self.fail_at == Some(self.reads) {
                return Err(ReaderError::new("synthetic failure"));
            }
            bufs.data.push_item(&[self.reads as u8]);
            bufs.targets.push_item(&[0]);
            self.reads += 1;
            Ok(())
        }

        fn reset(&mut self) {
            self.reads = 0;
        }
    }

    fn drain_one(pool: &BufferPool) -> u8 {
        let mut count = pool.lock();
        while BufferPool::empty(*count) {
            count = pool.wait_non_empty(count);
        }
        let slot = unsafe { &*pool.read_slot() };
        let byte = slot.data.item(0).unwrap()[0];
        pool.advance_read(&mut count);
        drop(count);
        pool.signal_non_full();
        byte
    }

    #[test]
    fn produces_batches_in_order_until_stopped() {
        let pool = Arc::new(BufferPool::new(4, 4, Some(4), false).unwrap());
        let reader = Arc::new(Mutex::new(CountingReader { reads: 0, fail_at: None }));

        let thread = ReadThread::start(pool.clone(), reader);

        for expected in 0..16u8 {
            assert_eq!(drain_one(&pool), expected);
        }

        thread.stop();
        while !thread.stopped() {
            std::thread::yield_now();
            pool.broadcast_non_full();
        }
        assert!(!thread.failed());
        thread.join();
    }

    #[test]
    fn reader_failure_terminates_the_thread() {
        let pool = Arc::new(BufferPool::new(4, 4, Some(4), false).unwrap());
        let reader = Arc::new(Mutex::new(CountingReader { reads: 0, fail_at: Some(1) }));

        let thread = ReadThread::start(pool.clone(), reader);

        assert_eq!(drain_one(&pool), 0);
        while !thread.stopped() {
            std::thread::yield_now();
        }
        assert!(thread.failed());
        thread.join();
    }
}
