// Copyright (c) 2025 NaturalIO

mod test_dma;
mod test_elevator;
mod test_owner;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use io_buffer::Buffer;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::completion::Completer;
use crate::config::SchedulerConfig;
use crate::dma::{DmaBuffer, DmaPool, DmaResource};
use crate::driver::{CompletionMode, MemoryDevice};
use crate::request::{IoBuffer, IoRequest};
use crate::roster::IoSchedulerRoster;
use crate::scheduler::IoScheduler;
use crate::tasks::{DispatchError, IoCallback, IoOperation};
use crate::threads::{IDLE_PRIORITY, ThreadId, ThreadTable};

pub const BLOCK: u64 = 512;

pub struct TempDevFile(pub String);

impl std::ops::Deref for TempDevFile {
    type Target = String;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for TempDevFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(path::Path::new(&self.0));
        info!("deleted {}", self.0);
    }
}

impl AsRef<path::Path> for TempDevFile {
    fn as_ref(&self) -> &std::path::Path {
        &path::Path::new(&self.0)
    }
}

// Create a temporary file name within the temporary directory configured in the environment.
pub fn make_temp_file() -> TempDevFile {
    let mut result = std::env::temp_dir();
    let filename = format!("test-io-scheduler-{}.dat", fastrand::u64(..));
    debug!("make_temp_file {}", filename);
    result.push(filename);
    TempDevFile(result.to_str().unwrap().to_string())
}

pub fn setup_log() {
    use captains_log::recipe::stderr_logger;
    let log_config = stderr_logger(log::Level::Debug).test();
    log_config.build().expect("setup_log");
}

pub fn create_temp_file(path: &path::Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .expect("openfile")
}

/// A buffer filled with a pattern derived from `seed`. Block multiples come back aligned.
pub fn pattern_buffer(len: usize, seed: u8) -> Buffer {
    let mut buf = if len % BLOCK as usize == 0 {
        Buffer::aligned(len as i32).unwrap()
    } else {
        Buffer::alloc(len as i32).unwrap()
    };
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(seed);
    }
    buf
}

pub fn zero_buffer(len: usize) -> Buffer {
    let mut buf = if len % BLOCK as usize == 0 {
        Buffer::aligned(len as i32).unwrap()
    } else {
        Buffer::alloc(len as i32).unwrap()
    };
    buf.fill(0);
    buf
}

pub fn write_request(thread: ThreadId, offset: u64, len: usize, seed: u8) -> Arc<IoRequest> {
    IoRequest::new(1, thread, offset, IoBuffer::new(pattern_buffer(len, seed)), true)
}

pub fn read_request(thread: ThreadId, offset: u64, len: usize) -> Arc<IoRequest> {
    IoRequest::new(1, thread, offset, IoBuffer::new(zero_buffer(len)), false)
}

pub fn request_data(request: &IoRequest) -> Vec<u8> {
    request.buffer().with(|b| b.to_vec())
}

pub fn thread_table(threads: &[ThreadId]) -> Arc<ThreadTable> {
    let table = ThreadTable::new();
    for thread in threads {
        table.register(*thread, IDLE_PRIORITY);
    }
    Arc::new(table)
}

/// Poll `f` until it holds, failing the test after a few seconds.
pub fn wait_until(what: &str, f: impl Fn() -> bool) {
    let start = Instant::now();
    while !f() {
        if start.elapsed() > Duration::from_secs(10) {
            panic!("timeout waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub length: u64,
    pub thread: Option<ThreadId>,
    pub iteration: u64,
    pub write: bool,
}

/// Remembers every dispatched operation before passing it on.
pub struct RecordingDevice<D: IoCallback> {
    inner: Arc<D>,
    records: Mutex<Vec<Record>>,
}

impl<D: IoCallback> RecordingDevice<D> {
    pub fn new(inner: Arc<D>) -> Arc<Self> {
        Arc::new(Self { inner, records: Mutex::new(Vec::new()) })
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Records grouped by scheduler iteration, in dispatch order.
    pub fn iterations(&self) -> Vec<Vec<Record>> {
        let mut iterations: Vec<Vec<Record>> = Vec::new();
        for record in self.records() {
            match iterations.last_mut() {
                Some(last) if last[0].iteration == record.iteration => last.push(record),
                _ => iterations.push(vec![record]),
            }
        }
        iterations
    }
}

impl<D: IoCallback> IoCallback for RecordingDevice<D> {
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError> {
        self.records.lock().push(Record {
            offset: operation.offset(),
            length: operation.length(),
            thread: operation.parent().map(|r| r.thread()),
            iteration: operation.iteration(),
            write: operation.is_write(),
        });
        self.inner.do_io(operation)
    }
}

/// Holds operations until the test lets them go.
pub struct GateDevice {
    held: Mutex<Vec<IoOperation>>,
    completer: Completer,
}

impl GateDevice {
    pub fn new(completer: Completer) -> Arc<Self> {
        Arc::new(Self { held: Mutex::new(Vec::new()), completer })
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Complete everything held as fully transferred.
    pub fn release_all(&self) -> usize {
        let held: Vec<IoOperation> = std::mem::take(&mut *self.held.lock());
        let count = held.len();
        for operation in held {
            let length = operation.length();
            self.completer.operation_completed(operation, Ok(()), length);
        }
        count
    }

    /// Complete everything held with at most `bytes` transferred each.
    pub fn release_short(&self, bytes: u64) -> usize {
        let held: Vec<IoOperation> = std::mem::take(&mut *self.held.lock());
        let count = held.len();
        for operation in held {
            let length = operation.length().min(bytes);
            self.completer.operation_completed(operation, Ok(()), length);
        }
        count
    }
}

impl IoCallback for GateDevice {
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError> {
        self.held.lock().push(operation);
        Ok(())
    }
}

/// A [DmaPool] that fails the Nth translation with a given error.
pub struct FaultyDma {
    pub inner: DmaPool,
    calls: AtomicUsize,
    fail_at: usize,
    errno: Errno,
    pub failures: AtomicUsize,
}

impl FaultyDma {
    pub fn new(inner: DmaPool, fail_at: usize, errno: Errno) -> Arc<Self> {
        Arc::new(Self { inner, calls: AtomicUsize::new(0), fail_at, errno, failures: AtomicUsize::new(0) })
    }
}

impl DmaResource for FaultyDma {
    fn buffer_count(&self) -> usize {
        self.inner.buffer_count()
    }

    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }

    fn translate_next(
        &self, request: &Arc<IoRequest>, operation: &mut IoOperation, max_length: u64,
    ) -> Result<(), Errno> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(self.errno);
        }
        self.inner.translate_next(request, operation, max_length)
    }

    fn recycle_buffer(&self, buffer: DmaBuffer) {
        self.inner.recycle_buffer(buffer)
    }
}

/// A scheduler on a RAM disk, with every dispatch recorded.
pub struct Harness {
    pub roster: Arc<IoSchedulerRoster>,
    pub threads: Arc<ThreadTable>,
    pub device: Arc<MemoryDevice>,
    pub recorder: Arc<RecordingDevice<MemoryDevice>>,
    pub scheduler: Arc<IoScheduler>,
}

impl Harness {
    /// Threads 1 to 8 are registered. Nothing runs before [Harness::start].
    pub fn new(
        config: SchedulerConfig, dma: Option<Arc<dyn DmaResource>>, device_size: usize, mode: CompletionMode,
    ) -> Self {
        let roster = IoSchedulerRoster::new();
        let threads = thread_table(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let scheduler = IoScheduler::new("test", config, dma, &roster, threads.clone()).expect("scheduler");
        let device = MemoryDevice::new(device_size, scheduler.completer(), mode).expect("device");
        let recorder = RecordingDevice::new(device.clone());
        scheduler.set_callback(recorder.clone());
        Self { roster, threads, device, recorder, scheduler }
    }

    pub fn start(self) -> Self {
        self.scheduler.init().expect("init");
        self
    }

    pub fn submit(&self, request: &Arc<IoRequest>) {
        self.scheduler.schedule_request(request.clone()).expect("schedule");
    }
}

/// DMA pool with `blocks_per_buffer` sized bounce buffers.
pub fn dma_pool(count: usize, blocks_per_buffer: u64) -> Arc<DmaPool> {
    Arc::new(DmaPool::new(count, blocks_per_buffer * BLOCK, BLOCK).expect("dma pool"))
}
