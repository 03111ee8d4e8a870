use std::{
    fmt::{Display, Formatter},
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::{
    decode::{DecodeFailure, DecodeThreadPool},
    device::Device,
    logger,
    media::{MediaFactory, TargetMode, TargetPolicy},
    pool::BufferPool,
    reader::{ReadThread, Reader},
};

#[derive(Debug)]
pub enum LoaderError {
    /// Pool allocation failed at `start`; the pipeline was not started.
    Allocation,
    /// The device failed to initialise or rejected an upload.
    Device,
    /// A worker's decoder failed.
    Decode,
    /// `next` was called on a loader that is not running.
    NotStarted,
}

impl Display for LoaderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for LoaderError {}

impl From<DecodeFailure> for LoaderError {
    fn from(failure: DecodeFailure) -> Self {
        match failure {
            DecodeFailure::Device => LoaderError::Device,
            DecodeFailure::Decode => LoaderError::Decode,
        }
    }
}

/// Static description of the batch layout moving through the pipeline.
#[derive(Clone, Copy, Debug)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub datum_size: usize,
    pub datum_type_size: usize,
    pub target_size: usize,
    pub target_type_size: usize,
    pub target_mode: TargetMode,
    pub target_policy: TargetPolicy,
    /// Overrides the derived decode worker count. Mostly useful in
    /// tests; production loads derive it from the host's parallelism.
    pub decode_threads: Option<usize>,
}

impl LoaderConfig {
    pub fn new(
        batch_size: usize,
        datum_size: usize,
        datum_type_size: usize,
        target_size: usize,
        target_type_size: usize,
    ) -> Self {
        Self {
            batch_size,
            datum_size,
            datum_type_size,
            target_size,
            target_type_size,
            target_mode: TargetMode::RawCopy,
            target_policy: TargetPolicy::TruncateAndPad,
            decode_threads: None,
        }
    }

    /// One decoded datum in bytes.
    pub fn datum_len(&self) -> usize {
        self.datum_size * self.datum_type_size
    }

    /// One stored target in bytes.
    pub fn target_len(&self) -> usize {
        self.target_size * self.target_type_size
    }

    /// Length of the per-batch metadata block in integers.
    pub fn meta_len(&self) -> usize {
        2 * self.batch_size
    }
}

/// Composes the pipeline and owns its lifecycle.
///
/// `next` blocks until a batch is resident on the device, releasing the
/// previous batch's slot *at entry*: the trainer's view of the other
/// device buffer stays valid until it asks for more.
pub struct Loader {
    config: LoaderConfig,
    reader: Arc<Mutex<dyn Reader>>,
    media: MediaFactory,
    device: Arc<dyn Device>,
    read_pool: Option<Arc<BufferPool>>,
    decode_pool: Option<Arc<BufferPool>>,
    read_thread: Option<ReadThread>,
    decode_threads: Option<DecodeThreadPool>,
    first: bool,
    batches_delivered: u64,
    timer: Instant,
}

impl Loader {
    pub fn new<R: Reader>(
        config: LoaderConfig,
        reader: R,
        media: MediaFactory,
        device: Arc<dyn Device>,
    ) -> Self {
        assert!(config.batch_size > 0, "batch size must be nonzero");
        assert!(config.datum_len() > 0, "datum length must be nonzero");
        assert!(config.target_len() > 0, "target length must be nonzero");

        Self {
            config,
            reader: Arc::new(Mutex::new(reader)),
            media,
            device,
            read_pool: None,
            decode_pool: None,
            read_thread: None,
            decode_threads: None,
            first: true,
            batches_delivered: 0,
            timer: Instant::now(),
        }
    }

    /// Allocates both pools and starts the pipeline threads, decode
    /// side first so the read side never publishes into a void.
    pub fn start(&mut self) -> Result<(), LoaderError> {
        if self.read_thread.is_some() {
            return Ok(());
        }

        self.first = true;

        let config = self.config;
        let data_len = config.batch_size * config.datum_len();
        let target_len = config.batch_size * config.target_len();
        let meta_len = config.meta_len();

        // Read buffers start off conservatively sized; the reader grows
        // them as its items demand.
        let read_pool = Arc::new(
            BufferPool::new(data_len / 8, target_len, Some(meta_len), false)
                .map_err(|_| LoaderError::Allocation)?,
        );

        let pinned = !self.device.is_cpu();
        let decode_pool = Arc::new(
            BufferPool::new(data_len, target_len, Some(meta_len), pinned)
                .map_err(|_| LoaderError::Allocation)?,
        );

        let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let requested = config.decode_threads.unwrap_or(cores).max(1);
        let items_per_thread = config.batch_size.div_ceil(requested);
        let workers = config.batch_size.div_ceil(items_per_thread).min(config.batch_size);

        let mut decode_threads = DecodeThreadPool::new(
            workers,
            config,
            read_pool.clone(),
            decode_pool.clone(),
            self.device.clone(),
            &self.media,
        );
        decode_threads.start();
        let read_thread = ReadThread::start(read_pool.clone(), self.reader.clone());

        self.read_pool = Some(read_pool);
        self.decode_pool = Some(decode_pool);
        self.read_thread = Some(read_thread);
        self.decode_threads = Some(decode_threads);
        self.batches_delivered = 0;
        self.timer = Instant::now();

        logger::report_pipeline_started(config.batch_size, workers);

        Ok(())
    }

    /// Blocks until the next batch is resident on the device.
    ///
    /// On every call but the first, the decode slot backing the
    /// previous batch is released first; until then the trainer's
    /// device buffer for that batch remains stable.
    pub fn next(&mut self) -> Result<(), LoaderError> {
        let decode_pool = self.decode_pool.as_ref().ok_or(LoaderError::NotStarted)?;
        let decode_threads = self.decode_threads.as_ref().ok_or(LoaderError::NotStarted)?;

        let mut count = decode_pool.lock();
        if self.first {
            self.first = false;
        } else {
            decode_pool.advance_read(&mut count);
            decode_pool.signal_non_full();
        }

        while BufferPool::empty(*count) {
            if decode_threads.manager_stopped() {
                return Err(decode_threads.failure().map_or(LoaderError::Decode, LoaderError::from));
            }
            count = decode_pool.wait_non_empty(count);
        }

        self.batches_delivered += 1;
        Ok(())
    }

    /// Copies the head batch into caller-provided host buffers and
    /// releases it in one call. Testing only; the production path
    /// consumes batches from the device's buffer slots.
    pub fn next_into(&mut self, data: &mut [u8], targets: &mut [u8]) -> Result<(), LoaderError> {
        let decode_pool = self.decode_pool.as_ref().ok_or(LoaderError::NotStarted)?;
        let decode_threads = self.decode_threads.as_ref().ok_or(LoaderError::NotStarted)?;

        let mut count = decode_pool.lock();
        while BufferPool::empty(*count) {
            if decode_threads.manager_stopped() {
                return Err(decode_threads.failure().map_or(LoaderError::Decode, LoaderError::from));
            }
            count = decode_pool.wait_non_empty(count);
        }

        // Safety: slot observed non-empty under the lock; this loader
        // is the decode pool's only consumer.
        let head = unsafe { &*decode_pool.read_slot() };
        data.copy_from_slice(&head.data.as_slice()[..data.len()]);
        targets.copy_from_slice(&head.targets.as_slice()[..targets.len()]);

        decode_pool.advance_read(&mut count);
        drop(count);
        decode_pool.signal_non_full();

        self.batches_delivered += 1;
        Ok(())
    }

    /// Stops the pipeline, repositions the reader to the start of the
    /// epoch and starts again.
    pub fn reset(&mut self) -> Result<(), LoaderError> {
        self.stop();
        self.reader.lock().unwrap().reset();
        self.start()
    }

    /// Tears the pipeline down: read side first, then both pools are
    /// drained so no decode thread stays parked on backpressure, then
    /// the decode side. Idempotent.
    pub fn stop(&mut self) {
        let Some(read_thread) = self.read_thread.take() else {
            return;
        };
        let mut decode_threads =
            self.decode_threads.take().expect("decode pool runs whenever the read thread does");

        read_thread.stop();
        while !read_thread.stopped() {
            std::thread::yield_now();
            self.drain();
            if let Some(pool) = &self.read_pool {
                pool.broadcast_non_full();
            }
        }
        read_thread.join();

        // Let the manager flush whatever both pools still hold, unless
        // it is already gone (e.g. the device never initialised).
        loop {
            let buffered = self.pool_buffered(&self.decode_pool) || self.pool_buffered(&self.read_pool);
            if !buffered || decode_threads.manager_stopped() {
                break;
            }
            self.drain();
            std::thread::yield_now();
        }

        decode_threads.stop();

        self.read_pool = None;
        self.decode_pool = None;
        self.first = true;

        logger::report_pipeline_stopped(self.batches_delivered, &self.timer);
    }

    pub fn reader(&self) -> Arc<Mutex<dyn Reader>> {
        self.reader.clone()
    }

    pub fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    /// True once the read thread has terminated on a reader error.
    pub fn read_failed(&self) -> bool {
        self.read_thread.as_ref().is_some_and(ReadThread::failed)
    }

    fn pool_buffered(&self, pool: &Option<Arc<BufferPool>>) -> bool {
        pool.as_ref().is_some_and(|pool| !BufferPool::empty(*pool.lock()))
    }

    /// Releases one decode slot without looking at it, unblocking a
    /// producer parked on the non-full condition.
    fn drain(&self) {
        let Some(pool) = &self.decode_pool else {
            return;
        };

        let mut count = pool.lock();
        if BufferPool::empty(*count) {
            return;
        }
        pool.advance_read(&mut count);
        drop(count);
        pool.signal_non_full();
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}
