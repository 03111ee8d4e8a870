use std::{
    ptr, slice,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
};

use crate::{
    buffer::BufferTriple,
    device::Device,
    layout,
    loader::LoaderConfig,
    media::{Media, MediaError, MediaFactory, TargetMode, TargetPolicy},
    pool::BufferPool,
};

/// Why the manager shut the pipeline down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Device init or upload failed.
    Device,
    /// A worker's decoder failed.
    Decode,
}

const FAILURE_NONE: u8 = 0;
const FAILURE_DEVICE: u8 = 1;
const FAILURE_DECODE: u8 = 2;

/// Per-batch rendezvous state. The manager publishes the input slot and
/// the output base pointers here before raising the per-worker tickets;
/// workers hand the batch back by counting into `end_signaled`.
struct BatchSync {
    tickets: Vec<bool>,
    end_signaled: usize,
    input: *const BufferTriple,
    out_data: *mut u8,
    out_targets: *mut u8,
    out_meta: *mut i32,
}

struct DecodeShared {
    sync: Mutex<BatchSync>,
    started: Condvar,
    ended: Condvar,
    done: AtomicBool,
    stop_manager: AtomicBool,
    manager_stopped: AtomicBool,
    worker_stopped: Vec<AtomicBool>,
    failure: AtomicU8,
}

// Safety: the pointers in `BatchSync` are only dereferenced between a
// raised ticket and the matching end signal, a window in which the
// manager guarantees the referenced slots stay put; each worker writes
// only its own disjoint item range.
unsafe impl Send for DecodeShared {}
unsafe impl Sync for DecodeShared {}

impl DecodeShared {
    fn fail(&self, code: u8) {
        let _ = self.failure.compare_exchange(FAILURE_NONE, code, Ordering::AcqRel, Ordering::Acquire);
    }

    fn failure(&self) -> Option<DecodeFailure> {
        match self.failure.load(Ordering::Acquire) {
            FAILURE_DEVICE => Some(DecodeFailure::Device),
            FAILURE_DECODE => Some(DecodeFailure::Decode),
            _ => None,
        }
    }
}

/// N decode workers plus the manager thread that feeds them.
///
/// The manager consumes one read-pool slot at a time, fans the batch out
/// to the workers over non-overlapping item ranges, waits for all of
/// them at the end barrier, transposes the finished batch to
/// feature-major layout and uploads it to the device's alternating
/// buffer slot.
pub struct DecodeThreadPool {
    shared: Arc<DecodeShared>,
    in_pool: Arc<BufferPool>,
    out_pool: Arc<BufferPool>,
    config: LoaderConfig,
    count: usize,
    items_per_thread: usize,
    device: Arc<dyn Device>,
    media: Vec<Box<dyn Media>>,
    workers: Vec<JoinHandle<()>>,
    manager: Option<JoinHandle<()>>,
}

impl DecodeThreadPool {
    pub fn new(
        count: usize,
        config: LoaderConfig,
        in_pool: Arc<BufferPool>,
        out_pool: Arc<BufferPool>,
        device: Arc<dyn Device>,
        media: &MediaFactory,
    ) -> Self {
        assert!(count >= 1);
        let items_per_thread = config.batch_size.div_ceil(count);
        assert!(items_per_thread * count >= config.batch_size);
        assert!(items_per_thread * (count - 1) < config.batch_size);

        let shared = Arc::new(DecodeShared {
            sync: Mutex::new(BatchSync {
                tickets: vec![false; count],
                end_signaled: 0,
                input: ptr::null(),
                out_data: ptr::null_mut(),
                out_targets: ptr::null_mut(),
                out_meta: ptr::null_mut(),
            }),
            started: Condvar::new(),
            ended: Condvar::new(),
            done: AtomicBool::new(false),
            stop_manager: AtomicBool::new(false),
            manager_stopped: AtomicBool::new(false),
            worker_stopped: (0..count).map(|_| AtomicBool::new(false)).collect(),
            failure: AtomicU8::new(FAILURE_NONE),
        });

        let media = (0..count).map(|id| media(id)).collect();

        Self {
            shared,
            in_pool,
            out_pool,
            config,
            count,
            items_per_thread,
            device,
            media,
            workers: Vec::new(),
            manager: None,
        }
    }

    pub fn start(&mut self) {
        for (id, media) in std::mem::take(&mut self.media).into_iter().enumerate() {
            let shared = self.shared.clone();
            let config = self.config;
            let items_per_thread = self.items_per_thread;
            self.workers.push(std::thread::spawn(move || {
                run_worker(&shared, &config, items_per_thread, id, media);
            }));
        }

        let shared = self.shared.clone();
        let in_pool = self.in_pool.clone();
        let out_pool = self.out_pool.clone();
        let device = self.device.clone();
        let config = self.config;
        let count = self.count;
        self.manager = Some(std::thread::spawn(move || {
            run_manager(&shared, &in_pool, &out_pool, device.as_ref(), &config, count);
        }));
    }

    pub fn manager_stopped(&self) -> bool {
        self.shared.manager_stopped.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<DecodeFailure> {
        self.shared.failure()
    }

    fn workers_stopped(&self) -> bool {
        self.shared.worker_stopped.iter().all(|stopped| stopped.load(Ordering::Acquire))
    }

    /// Terminates workers and manager, whichever conditions they are
    /// parked on. Threads can be suspended at several distinct wait
    /// sites, so both phases keep signalling until the target confirms
    /// it has stopped.
    pub fn stop(&mut self) {
        if self.manager.is_none() && self.workers.is_empty() {
            return;
        }

        self.shared.done.store(true, Ordering::Release);
        self.shared.started.notify_all();
        while !self.workers_stopped() {
            std::thread::yield_now();
            // try_lock: the manager may hold the pool mutex across a
            // whole batch, and it is not the one being woken here.
            if let Some(mut count) = self.in_pool.try_lock() {
                self.in_pool.advance_write(&mut count);
            }
            self.in_pool.signal_non_empty();
            self.shared.started.notify_all();
        }

        self.shared.stop_manager.store(true, Ordering::Release);
        while !self.manager_stopped() {
            std::thread::yield_now();
            if let Some(mut count) = self.in_pool.try_lock() {
                self.in_pool.advance_write(&mut count);
            }
            self.in_pool.broadcast_non_empty();
            self.out_pool.broadcast_non_full();
            {
                let mut sync = self.shared.sync.lock().unwrap();
                sync.end_signaled += 1;
            }
            self.shared.ended.notify_one();
        }

        for worker in self.workers.drain(..) {
            worker.join().unwrap();
        }
        if let Some(manager) = self.manager.take() {
            manager.join().unwrap();
        }
    }
}

fn run_manager(
    shared: &DecodeShared,
    in_pool: &BufferPool,
    out_pool: &BufferPool,
    device: &dyn Device,
    config: &LoaderConfig,
    worker_count: usize,
) {
    if let Err(err) = device.init() {
        eprintln!("{err}");
        shared.fail(FAILURE_DEVICE);
        shared.stop_manager.store(true, Ordering::Release);
    }

    let mut buffer_idx = 0usize;
    let mut scratch = Vec::new();

    while !shared.stop_manager.load(Ordering::Acquire) {
        consume(shared, in_pool, out_pool, device, config, worker_count, &mut buffer_idx, &mut scratch);
    }

    shared.manager_stopped.store(true, Ordering::Release);

    // Wake any consumer parked on the decode pool so it can observe the
    // stopped pipeline; taking the lock first closes the window where a
    // waiter checked the flag but has not parked yet.
    drop(out_pool.lock());
    out_pool.broadcast_non_empty();
}

#[allow(clippy::too_many_arguments)]
fn consume(
    shared: &DecodeShared,
    in_pool: &BufferPool,
    out_pool: &BufferPool,
    device: &dyn Device,
    config: &LoaderConfig,
    worker_count: usize,
    buffer_idx: &mut usize,
    scratch: &mut Vec<u8>,
) {
    let mut count = in_pool.lock();
    while BufferPool::empty(*count) {
        count = in_pool.wait_non_empty(count);
        if shared.stop_manager.load(Ordering::Acquire) {
            return;
        }
    }

    // Safety: single consumer of the read pool; the slot was observed
    // non-empty under the lock and is not released until after produce.
    let input = unsafe { in_pool.read_slot() };
    produce(shared, out_pool, device, config, worker_count, input, buffer_idx, scratch);

    in_pool.advance_read(&mut count);
    drop(count);
    in_pool.signal_non_full();
}

#[allow(clippy::too_many_arguments)]
fn produce(
    shared: &DecodeShared,
    out_pool: &BufferPool,
    device: &dyn Device,
    config: &LoaderConfig,
    worker_count: usize,
    input: *const BufferTriple,
    buffer_idx: &mut usize,
    scratch: &mut Vec<u8>,
) {
    let mut count = out_pool.lock();
    while BufferPool::full(*count) {
        count = out_pool.wait_non_full(count);
        if shared.stop_manager.load(Ordering::Acquire) {
            return;
        }
    }

    {
        // Safety: single producer of the decode pool, and the workers
        // are quiescent between batches, so the write slot is
        // exclusively ours while we publish its base pointers.
        let out = unsafe { &mut *out_pool.write_slot() };
        let out_data = out.data.as_mut_ptr();
        let out_targets = out.targets.as_mut_ptr();
        let out_meta = out.meta.as_mut().map_or(ptr::null_mut(), |meta| meta.as_mut_ptr());

        let mut sync = shared.sync.lock().unwrap();
        sync.input = input;
        sync.out_data = out_data;
        sync.out_targets = out_targets;
        sync.out_meta = out_meta;
        for ticket in sync.tickets.iter_mut() {
            *ticket = true;
        }
    }
    shared.started.notify_all();

    {
        let mut sync = shared.sync.lock().unwrap();
        while sync.end_signaled < worker_count {
            sync = shared.ended.wait(sync).unwrap();
            if shared.stop_manager.load(Ordering::Acquire) {
                return;
            }
        }
        sync.end_signaled = 0;
    }

    // The whole batch is decoded and the workers are parked again.
    if shared.failure().is_some() {
        shared.stop_manager.store(true, Ordering::Release);
        return;
    }

    let out = unsafe { &mut *out_pool.write_slot() };
    layout::transpose(
        out.data.as_mut_slice(),
        config.batch_size,
        config.datum_size,
        config.datum_type_size,
        scratch,
    );
    layout::transpose(
        out.targets.as_mut_slice(),
        config.batch_size,
        config.target_size,
        config.target_type_size,
        scratch,
    );

    let uploaded = device
        .copy_data(*buffer_idx, &out.data)
        .and_then(|()| device.copy_labels(*buffer_idx, &out.targets))
        .and_then(|()| match out.meta.as_ref() {
            Some(meta) => device.copy_meta(*buffer_idx, meta),
            None => Ok(()),
        });

    if let Err(err) = uploaded {
        eprintln!("{err}");
        shared.fail(FAILURE_DEVICE);
        shared.stop_manager.store(true, Ordering::Release);
        return;
    }

    *buffer_idx = 1 - *buffer_idx;
    out_pool.advance_write(&mut count);
    drop(count);
    out_pool.signal_non_empty();
}

fn run_worker(
    shared: &DecodeShared,
    config: &LoaderConfig,
    items_per_thread: usize,
    id: usize,
    mut media: Box<dyn Media>,
) {
    let start_ind = id * items_per_thread;
    let end_ind = config.batch_size.min(start_ind + items_per_thread);

    while !shared.done.load(Ordering::Acquire) {
        work(shared, config, start_ind, end_ind, id, media.as_mut());
    }

    shared.worker_stopped[id].store(true, Ordering::Release);
}

fn work(
    shared: &DecodeShared,
    config: &LoaderConfig,
    start_ind: usize,
    end_ind: usize,
    id: usize,
    media: &mut dyn Media,
) {
    let (input, out_data, out_targets, out_meta) = {
        let mut sync = shared.sync.lock().unwrap();
        loop {
            if shared.done.load(Ordering::Acquire) {
                return;
            }
            if sync.tickets[id] {
                break;
            }
            sync = shared.started.wait(sync).unwrap();
        }
        sync.tickets[id] = false;
        (sync.input, sync.out_data, sync.out_targets, sync.out_meta)
    };

    let datum_len = config.datum_len();
    let target_len = config.target_len();

    // Safety: the manager published these pointers before raising our
    // ticket and blocks on the end barrier until we signal, so the
    // input slot is stable; the output regions below belong to this
    // worker's item range alone, so no locking is needed while writing.
    let input = unsafe { &*input };

    for i in start_ind..end_ind {
        let enc_datum = input.data.item(i).expect("read slot short of datum items");
        let enc_target = input.targets.item(i).expect("read slot short of target items");

        let datum = unsafe { slice::from_raw_parts_mut(out_data.add(i * datum_len), datum_len) };
        let target = unsafe { slice::from_raw_parts_mut(out_targets.add(i * target_len), target_len) };

        let decoded = if config.target_mode == TargetMode::ReadContents {
            media.transform_joint(enc_datum, enc_target, datum, target)
        } else {
            transform_split(media, config, enc_datum, enc_target, datum, target, out_meta, i)
        };

        if let Err(err) = decoded {
            eprintln!("{err}");
            shared.fail(FAILURE_DECODE);
            datum.fill(0);
            target.fill(0);
        }
    }

    {
        let mut sync = shared.sync.lock().unwrap();
        sync.end_signaled += 1;
        assert!(sync.end_signaled <= shared.worker_stopped.len());
    }
    shared.ended.notify_one();
}

#[allow(clippy::too_many_arguments)]
fn transform_split(
    media: &mut dyn Media,
    config: &LoaderConfig,
    enc_datum: &[u8],
    enc_target: &[u8],
    datum: &mut [u8],
    target: &mut [u8],
    out_meta: *mut i32,
    item: usize,
) -> Result<(), MediaError> {
    let mut meta_val = 0i32;
    media.transform(enc_datum, datum, &mut meta_val)?;

    match config.target_policy {
        TargetPolicy::TruncateAndPad => {
            let stored = enc_target.len().min(target.len());
            target[..stored].copy_from_slice(&enc_target[..stored]);
            target[stored..].fill(0);
        }
    }

    if !out_meta.is_null() {
        // The original encoded length goes into the second half of the
        // metadata block, so truncation stays visible to the consumer.
        unsafe {
            *out_meta.add(item) = meta_val;
            *out_meta.add(config.batch_size + item) = enc_target.len() as i32;
        }
    }

    Ok(())
}
