// Copyright (c) 2025 NaturalIO

//! # IoScheduler
//!
//! One scheduler serves one device queue. Callers hand in [IoRequest]s with
//! [IoScheduler::schedule_request], a scheduler thread carves them into [IoOperation]s and
//! feeds them to the device through [IoCallback], and the device reports back with
//! [Completer::operation_completed].
//!
//! Each scheduler iteration:
//!
//! 1. Picks active owners round robin. Every owner gets a quantum of bytes, the iteration as
//!    a whole is capped by the iteration bandwidth. Operations an owner has to retry go out
//!    first, then its pending requests are prepared front to back.
//! 2. Sorts the collected batch with the elevator and dispatches it.
//! 3. Waits until every operation of the batch came back, running the finisher on completed
//!    operations as they arrive.
//!
//! An owner cut short by the iteration bandwidth resumes with the rest of its quantum in the
//! next iteration.
//!
//! Lock order is scheduler state, then request state. The DMA resource and the device are
//! called without the request lock, the device without the scheduler lock. Completion does
//! not lock at all.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::sync::Parker;
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::callback_worker::RequestNotifier;
use crate::completion::{CompletionQueue, Completer};
use crate::config::{Bandwidth, SchedulerConfig};
use crate::dma::DmaResource;
use crate::elevator::elevator_sort;
use crate::owner::{ActiveOwners, IoRequestOwner};
use crate::request::IoRequest;
use crate::roster::{EventCode, IoSchedulerRoster, SchedulerEvent};
use crate::tasks::{DispatchError, IoCallback, IoOperation, OperationPhase};
use crate::threads::{IDLE_PRIORITY, TeamId, ThreadId, ThreadInfo};

/// How long to back off when no operation could be prepared.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub iterations: u64,
    pub operations_dispatched: u64,
    /// Operations that needed another round, e.g. after a short transfer.
    pub operations_retried: u64,
    pub requests_scheduled: u64,
    pub requests_finished: u64,
}

#[derive(Default)]
struct Counters {
    iterations: AtomicU64,
    operations_dispatched: AtomicU64,
    operations_retried: AtomicU64,
    requests_scheduled: AtomicU64,
    requests_finished: AtomicU64,
}

struct SchedulerState {
    /// Fixed set of slots, one per thread that may use the scheduler.
    owners: Vec<IoRequestOwner>,
    owner_table: HashMap<ThreadId, usize>,
    unused_owners: VecDeque<usize>,
    active: ActiveOwners,
    unused_operations: Vec<IoOperation>,
    /// Dispatched operations not yet through the finisher.
    pending_operations: usize,
    /// Block ranges of read-before-write operations, by operation id, held from the read
    /// until the operation is recycled. Overlapping ones wait, or the later read would miss
    /// the earlier write.
    merging: HashMap<usize, (u64, u64)>,
    terminating: bool,
}

/// Result of preparing operations for one request, with the device bytes used up.
enum Prepared {
    Ready(u64),
    /// Out of operations or DMA buffers, try again next iteration.
    Busy(u64),
    Failed(Errno, u64),
}

struct SchedulerInner {
    id: i32,
    name: String,
    bandwidth: Bandwidth,
    operation_count: usize,
    notifier_queue_depth: usize,
    dma: Option<Arc<dyn DmaResource>>,
    thread_info: Arc<dyn ThreadInfo>,
    roster: Arc<IoSchedulerRoster>,
    callback: RwLock<Option<Arc<dyn IoCallback>>>,
    state: Mutex<SchedulerState>,
    new_request: Condvar,
    completed: Arc<CompletionQueue>,
    completer: Completer,
    /// Only the thread waiting for a batch parks here.
    finished_operation: Mutex<Parker>,
    notifier: RwLock<Option<RequestNotifier>>,
    stats: Counters,
}

pub struct IoScheduler {
    inner: Arc<SchedulerInner>,
    scheduler_thread: Mutex<Option<thread::JoinHandle<()>>>,
    notifier_thread: Mutex<Option<thread::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl IoScheduler {
    /// Set up a scheduler. Nothing runs until [IoScheduler::init].
    ///
    /// With a DMA resource its block size and buffer count take precedence, and
    /// `config.block_size` must either be 0 or agree with it.
    pub fn new(
        name: &str, config: SchedulerConfig, dma: Option<Arc<dyn DmaResource>>,
        roster: &Arc<IoSchedulerRoster>, thread_info: Arc<dyn ThreadInfo>,
    ) -> io::Result<Arc<Self>> {
        if config.max_threads == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "max_threads must not be 0"));
        }
        let dma_block_size = dma.as_ref().map(|dma| dma.block_size());
        let block_size = config.effective_block_size(dma_block_size);
        if let Some(dma_block_size) = dma_block_size {
            if dma_block_size != block_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("block size {} does not match the DMA resource's {}", block_size, dma_block_size),
                ));
            }
        }
        let operation_count = match dma.as_ref() {
            Some(dma) => dma.buffer_count(),
            None => config.operation_count,
        };
        if operation_count == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no operations to schedule with"));
        }
        let bandwidth = Bandwidth::new(&config, block_size);
        let id = roster.next_scheduler_id();

        let (completed, parker) = CompletionQueue::new();
        let state = SchedulerState {
            owners: (0..config.max_threads).map(|_| IoRequestOwner::new()).collect(),
            owner_table: HashMap::with_capacity(config.max_threads),
            unused_owners: (0..config.max_threads).collect(),
            active: ActiveOwners::new(),
            unused_operations: (0..operation_count).rev().map(IoOperation::new).collect(),
            pending_operations: 0,
            merging: HashMap::new(),
            terminating: false,
        };
        let inner = Arc::new(SchedulerInner {
            id,
            name: name.to_string(),
            bandwidth,
            operation_count,
            notifier_queue_depth: config.notifier_queue_depth,
            dma,
            thread_info,
            roster: roster.clone(),
            callback: RwLock::new(None),
            state: Mutex::new(state),
            new_request: Condvar::new(),
            completer: Completer::new(completed.clone()),
            completed,
            finished_operation: Mutex::new(parker),
            notifier: RwLock::new(None),
            stats: Counters::default(),
        });
        debug!(
            "{}: scheduler {} block {} bandwidth {:?} operations {}",
            name, id, block_size, bandwidth, operation_count
        );
        Ok(Arc::new(Self {
            inner,
            scheduler_thread: Mutex::new(None),
            notifier_thread: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Start the scheduler and notifier threads and register with the roster.
    pub fn init(self: &Arc<Self>) -> io::Result<()> {
        let mut scheduler_thread = self.scheduler_thread.lock();
        if scheduler_thread.is_some() || self.shut_down.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "scheduler already started"));
        }
        let inner = &self.inner;
        let (notifier, notifier_th) = RequestNotifier::new(
            format!("{} notifier {}", inner.name, inner.id),
            inner.notifier_queue_depth,
            inner.roster.clone(),
            inner.id,
        )?;
        inner.notifier.write().replace(notifier);
        self.notifier_thread.lock().replace(notifier_th);

        let inner1 = inner.clone();
        let th = thread::Builder::new()
            .name(format!("{} scheduler {}", inner.name, inner.id))
            .spawn(move || inner1.run())?;
        scheduler_thread.replace(th);
        drop(scheduler_thread);

        inner.roster.add_scheduler(self);
        Ok(())
    }

    #[inline(always)]
    pub fn id(&self) -> i32 {
        self.inner.id
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline(always)]
    pub fn block_size(&self) -> u64 {
        self.inner.bandwidth.block_size
    }

    #[inline(always)]
    pub fn bandwidth(&self) -> Bandwidth {
        self.inner.bandwidth
    }

    /// Handle for the device to report completed operations with.
    #[inline]
    pub fn completer(&self) -> Completer {
        self.inner.completer.clone()
    }

    /// Set the device operations are dispatched to. Without one every operation fails with
    /// `ENODEV`.
    pub fn set_callback(&self, callback: Arc<dyn IoCallback>) {
        self.inner.callback.write().replace(callback);
    }

    /// Queue `request` for its thread's owner.
    ///
    /// Failing requests are notified before this returns. The error is also returned, for
    /// callers that do not wait on the request.
    pub fn schedule_request(&self, request: Arc<IoRequest>) -> Result<(), Errno> {
        self.inner.schedule_request(request)
    }

    #[inline]
    pub fn operation_completed(&self, operation: IoOperation, status: Result<(), Errno>, transferred: u64) {
        self.inner.completer.operation_completed(operation, status, transferred);
    }

    /// Cancel a scheduled request with `status`.
    ///
    /// Parts not yet dispatched are dropped. Operations already on the device run to
    /// completion, the request is notified with `status` once the last one came back.
    /// Returns false when the request is not (or no longer) in the scheduler.
    pub fn abort_request(&self, request: &Arc<IoRequest>, status: Errno) -> bool {
        let mut aborted = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if request.owner().is_none() {
                return false;
            }
            debug!("{}: abort {:?} with {}", self.inner.name, request, status);
            self.inner.abort_locked(&mut state, request, status, &mut aborted);
        }
        for request in aborted {
            self.inner.deliver(request);
        }
        true
    }

    /// Stop scheduling.
    ///
    /// Operations on the device are waited for, queued requests fail with `ECANCELED`, and
    /// pending notifications are delivered before the notifier stops. Also run on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;
        info!("{}: scheduler {} shutting down", inner.name, inner.id);
        {
            let mut state = inner.state.lock();
            state.terminating = true;
            inner.new_request.notify_all();
        }
        inner.completed.wake();
        if let Some(th) = self.scheduler_thread.lock().take() {
            join_thread(th);
        }

        inner.drain_operations();
        let mut aborted = Vec::new();
        {
            let mut state = inner.state.lock();
            let queued: Vec<Arc<IoRequest>> = state
                .owners
                .iter()
                .flat_map(|owner| owner.requests.iter().chain(owner.completed_requests.iter()))
                .cloned()
                .collect();
            for request in queued.iter() {
                inner.abort_locked(&mut state, request, Errno::ECANCELED, &mut aborted);
            }
        }
        for request in aborted {
            inner.deliver(request);
        }

        inner.notifier.write().take();
        if let Some(th) = self.notifier_thread.lock().take() {
            join_thread(th);
        }
        inner.roster.remove_scheduler(inner.id);
    }

    pub fn stats(&self) -> SchedulerStats {
        let stats = &self.inner.stats;
        SchedulerStats {
            iterations: stats.iterations.load(Ordering::Relaxed),
            operations_dispatched: stats.operations_dispatched.load(Ordering::Relaxed),
            operations_retried: stats.operations_retried.load(Ordering::Relaxed),
            requests_scheduled: stats.requests_scheduled.load(Ordering::Relaxed),
            requests_finished: stats.requests_finished.load(Ordering::Relaxed),
        }
    }

    pub fn active_owner_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn unused_owner_count(&self) -> usize {
        self.inner.state.lock().unused_owners.len()
    }

    pub fn unused_operation_count(&self) -> usize {
        self.inner.state.lock().unused_operations.len()
    }

    #[inline(always)]
    pub fn operation_count(&self) -> usize {
        self.inner.operation_count
    }

    /// Human readable state of the scheduler and its active owners.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = self.inner.dump(&mut out);
        out
    }

    /// State of the owner serving `thread`, if it has one.
    pub fn dump_owner(&self, thread: ThreadId) -> Option<String> {
        let state = self.inner.state.lock();
        let slot = *state.owner_table.get(&thread)?;
        let mut out = String::new();
        let _ = state.owners[slot].dump(slot, &mut out);
        Some(out)
    }
}

fn join_thread(th: thread::JoinHandle<()>) {
    if th.thread().id() == thread::current().id() {
        warn!("scheduler dropped on its own thread, not joining");
        return;
    }
    if th.join().is_err() {
        error!("scheduler thread panicked");
    }
}

impl SchedulerInner {
    #[inline]
    fn emit(&self, code: EventCode, request: Option<&IoRequest>, operation: Option<&IoOperation>) {
        if !self.roster.has_listeners() {
            return;
        }
        let mut event = SchedulerEvent::new(code, self.id).with_request(request);
        if let Some(operation) = operation {
            event = event.with_operation(operation);
        }
        self.roster.notify(&event);
    }

    fn schedule_request(&self, request: Arc<IoRequest>) -> Result<(), Errno> {
        trace!("{}: schedule {:?}", self.name, request);
        if request.length() == 0 {
            request.set_status_and_notify(Err(Errno::EINVAL));
            return Err(Errno::EINVAL);
        }
        if request.buffer().is_virtual() {
            if let Err(e) = request.buffer().lock_memory() {
                debug!("{}: locking memory of {:?} failed: {}", self.name, request, e);
                request.set_status_and_notify(Err(e));
                return Err(e);
            }
        }

        let mut state = self.state.lock();
        if state.terminating {
            drop(state);
            request.set_status_and_notify(Err(Errno::ECANCELED));
            return Err(Errno::ECANCELED);
        }
        let Some(slot) = self.get_request_owner(&mut state, request.team(), request.thread()) else {
            drop(state);
            error!("{}: no free owner for thread {}, max_threads too small", self.name, request.thread());
            request.set_status_and_notify(Err(Errno::ENOMEM));
            return Err(Errno::ENOMEM);
        };
        let priority = self.thread_info.io_priority(request.thread()).unwrap_or(IDLE_PRIORITY);
        let owner = &mut state.owners[slot];
        let was_active = owner.is_active();
        owner.priority = priority;
        request.set_owner(Some(slot));
        owner.requests.push_back(request.clone());
        if !was_active {
            state.active.push(slot);
        }
        self.new_request.notify_all();
        drop(state);

        self.stats.requests_scheduled.fetch_add(1, Ordering::Relaxed);
        self.emit(EventCode::RequestScheduled, Some(&request), None);
        Ok(())
    }

    /// Find the owner of `thread`, or hand it a free one.
    ///
    /// A free slot is only taken over from another thread once that thread is gone.
    fn get_request_owner(&self, state: &mut SchedulerState, team: TeamId, thread: ThreadId) -> Option<usize> {
        if let Some(&slot) = state.owner_table.get(&thread) {
            if !state.owners[slot].is_active() {
                state.unused_owners.retain(|&s| s != slot);
            }
            return Some(slot);
        }
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(slot) = state.unused_owners.pop_front() {
            match state.owners[slot].thread {
                Some(previous) if self.thread_info.is_alive(previous) => skipped.push(slot),
                previous => {
                    if let Some(previous) = previous {
                        state.owner_table.remove(&previous);
                    }
                    found = Some(slot);
                    break;
                }
            }
        }
        state.unused_owners.extend(skipped);
        let slot = found?;
        let owner = &mut state.owners[slot];
        owner.team = team;
        owner.thread = Some(thread);
        owner.priority = IDLE_PRIORITY;
        state.owner_table.insert(thread, slot);
        trace!("{}: owner {} for team {} thread {}", self.name, slot, team, thread);
        Some(slot)
    }

    /// Quantum granted to an owner each time it is picked.
    ///
    /// Every priority gets the same share for now.
    #[inline(always)]
    fn owner_bandwidth(&self, _priority: i32) -> u64 {
        self.bandwidth.min_owner
    }

    fn run(self: Arc<Self>) {
        info!("{}: scheduler {} start", self.name, self.id);
        let block = self.bandwidth.block_size;
        let mut batch: Vec<IoOperation> = Vec::with_capacity(self.operation_count);
        let mut aborted: Vec<Arc<IoRequest>> = Vec::new();
        let mut carry: Option<u64> = None;
        loop {
            let mut state = self.state.lock();
            if state.terminating {
                break;
            }
            let resume = carry.take().and_then(|quantum| {
                let slot = state.active.current()?;
                (quantum >= block && state.owners[slot].has_schedulable_work()).then_some((slot, quantum))
            });
            let (mut slot, mut quantum) = match resume {
                Some(resume) => resume,
                None => match self.next_active_owner(&mut state) {
                    Some(slot) => (slot, self.owner_bandwidth(state.owners[slot].priority)),
                    None => break,
                },
            };

            let mut iteration_bandwidth = self.bandwidth.iteration;
            let mut stalled = 0;
            loop {
                let progress = self.collect_owner_operations(
                    &mut state,
                    slot,
                    &mut quantum,
                    &mut iteration_bandwidth,
                    &mut batch,
                    &mut aborted,
                );
                if iteration_bandwidth < block {
                    if quantum >= block
                        && state.active.current() == Some(slot)
                        && state.owners[slot].has_schedulable_work()
                    {
                        carry = Some(quantum);
                    }
                    break;
                }
                if progress {
                    stalled = 0;
                } else {
                    stalled += 1;
                }
                // A whole round without progress.
                if stalled >= state.active.len() {
                    break;
                }
                match state.active.advance() {
                    Some(next) => {
                        slot = next;
                        quantum = self.owner_bandwidth(state.owners[slot].priority);
                    }
                    None => break,
                }
            }

            if batch.is_empty() && aborted.is_empty() {
                debug!("{}: nothing to dispatch, back off", self.name);
                let _ = self.new_request.wait_for(&mut state, IDLE_BACKOFF);
                continue;
            }
            state.pending_operations += batch.len();
            drop(state);

            for request in aborted.drain(..) {
                self.deliver(request);
            }
            if batch.is_empty() {
                continue;
            }
            self.dispatch(&mut batch);
            self.wait_for_operations();
        }
        info!("{}: scheduler {} exit", self.name, self.id);
    }

    /// Step the round robin to the next owner, waiting for one to show up if needed.
    /// `None` once the scheduler terminates.
    fn next_active_owner(&self, state: &mut MutexGuard<'_, SchedulerState>) -> Option<usize> {
        loop {
            if state.terminating {
                return None;
            }
            if let Some(slot) = state.active.advance() {
                return Some(slot);
            }
            if self.completed.has_pending() {
                MutexGuard::unlocked(state, || self.finish_operations());
                continue;
            }
            self.new_request.wait(state);
        }
    }

    /// Move as much of the owner's work into `batch` as its quantum and the iteration allow.
    /// Returns whether anything was added.
    fn collect_owner_operations(
        &self, state: &mut SchedulerState, slot: usize, quantum: &mut u64, iteration_bandwidth: &mut u64,
        batch: &mut Vec<IoOperation>, aborted: &mut Vec<Arc<IoRequest>>,
    ) -> bool {
        let block = self.bandwidth.block_size;
        let mut progress = false;
        let mut blocked = VecDeque::new();
        while let Some(operation) = state.owners[slot].operations.pop_front() {
            if !Self::hold_merge_range(state, &operation) {
                blocked.push_back(operation);
                continue;
            }
            let length = operation.length();
            *quantum = quantum.saturating_sub(length);
            *iteration_bandwidth = iteration_bandwidth.saturating_sub(length);
            batch.push(operation);
            progress = true;
        }
        state.owners[slot].operations = blocked;

        while *quantum >= block && *iteration_bandwidth >= block {
            let Some(request) = state.owners[slot].requests.front().cloned() else {
                break;
            };
            let max_length = (*quantum).min(*iteration_bandwidth);
            let (used, outcome) = match self.prepare_request_operations(state, slot, &request, max_length, batch) {
                Prepared::Ready(used) => (used, Ok(())),
                Prepared::Busy(used) => (used, Err(Errno::EBUSY)),
                Prepared::Failed(errno, used) => (used, Err(errno)),
            };
            *quantum = quantum.saturating_sub(used);
            *iteration_bandwidth = iteration_bandwidth.saturating_sub(used);
            if used > 0 {
                progress = true;
            }
            match outcome {
                Ok(()) => {
                    if request.remaining_bytes() == 0 {
                        state.owners[slot].complete_head(&request);
                    }
                }
                Err(Errno::EBUSY) => break,
                Err(errno) => {
                    warn!("{}: preparing {:?} failed: {}", self.name, request, errno);
                    self.abort_locked(state, &request, errno, aborted);
                    progress = true;
                }
            }
        }
        progress
    }

    /// Carve operations for up to `max_length` device bytes out of `request`.
    fn prepare_request_operations(
        &self, state: &mut SchedulerState, slot: usize, request: &Arc<IoRequest>, max_length: u64,
        batch: &mut Vec<IoOperation>,
    ) -> Prepared {
        let Some(dma) = self.dma.as_ref() else {
            let Some(mut operation) = state.unused_operations.pop() else {
                return Prepared::Busy(0);
            };
            return match operation.prepare(request) {
                Ok(()) => {
                    let length = operation.length();
                    request.advance(length);
                    batch.push(operation);
                    Prepared::Ready(length)
                }
                Err(e) => {
                    state.unused_operations.push(operation);
                    Prepared::Failed(e, 0)
                }
            };
        };

        let block = self.bandwidth.block_size;
        let mut used = 0;
        while max_length - used >= block && request.remaining_bytes() > 0 {
            let Some(mut operation) = state.unused_operations.pop() else {
                return Prepared::Busy(used);
            };
            match dma.translate_next(request, &mut operation, max_length - used) {
                Ok(()) => {
                    used += operation.length();
                    if Self::hold_merge_range(state, &operation) {
                        batch.push(operation);
                    } else {
                        trace!("{}: {:?} waits for an overlapping merge", self.name, operation);
                        state.owners[slot].operations.push_back(operation);
                    }
                }
                Err(Errno::EBUSY) => {
                    state.unused_operations.push(operation);
                    debug!("{}: DMA resource busy for {:?}", self.name, request);
                    return Prepared::Busy(used);
                }
                Err(e) => {
                    state.unused_operations.push(operation);
                    return Prepared::Failed(e, used);
                }
            }
        }
        Prepared::Ready(used)
    }

    fn dispatch(&self, batch: &mut Vec<IoOperation>) {
        let sweeps = elevator_sort(batch);
        let iteration = self.stats.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("{}: iteration {} dispatch {} operations in {} sweeps", self.name, iteration, batch.len(), sweeps);
        let callback = self.callback.read().clone();
        for mut operation in batch.drain(..) {
            operation.set_iteration(iteration);
            self.emit(EventCode::OperationStarted, operation.parent().map(|r| &**r), Some(&operation));
            self.stats.operations_dispatched.fetch_add(1, Ordering::Relaxed);
            let result = match callback.as_ref() {
                Some(callback) => callback.do_io(operation),
                None => Err(DispatchError(operation, Errno::ENODEV)),
            };
            if let Err(DispatchError(operation, errno)) = result {
                warn!("{}: dispatch of {:?} failed: {}", self.name, operation, errno);
                self.completer.operation_completed(operation, Err(errno), 0);
            }
            self.finish_operations();
        }
    }

    /// Wait until the current batch is through the finisher.
    fn wait_for_operations(&self) {
        loop {
            {
                let state = self.state.lock();
                if state.pending_operations == 0 || state.terminating {
                    return;
                }
            }
            if !self.completed.has_pending() {
                self.finished_operation.lock().park();
            }
            self.finish_operations();
        }
    }

    /// Like [SchedulerInner::wait_for_operations], regardless of termination.
    fn drain_operations(&self) {
        loop {
            self.finish_operations();
            let pending = self.state.lock().pending_operations;
            if pending == 0 {
                return;
            }
            debug!("{}: waiting for {} operations", self.name, pending);
            if !self.completed.has_pending() {
                self.finished_operation.lock().park();
            }
        }
    }

    /// The finisher: take completed operations off the queue and push their results up.
    fn finish_operations(&self) -> bool {
        let mut finished_any = false;
        while let Some(mut operation) = self.completed.pop() {
            finished_any = true;
            let done = operation.finish();
            self.emit(EventCode::OperationFinished, operation.parent().map(|r| &**r), Some(&operation));
            trace!("{}: finished {:?} done={}", self.name, operation, done);

            if !done {
                // Under the lock, so an abort either sees the retry queued or we see its error.
                let mut state = self.state.lock();
                let retry_owner = operation.parent().filter(|r| !r.has_failed()).and_then(|r| r.owner());
                if let Some(slot) = retry_owner {
                    state.owners[slot].operations.push_back(operation);
                    state.pending_operations = state.pending_operations.saturating_sub(1);
                    self.stats.operations_retried.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let Some(request) = operation.take_parent() else {
                log_debug_assert!(false, "{:?} finished without request", operation);
                let mut state = self.state.lock();
                state.pending_operations = state.pending_operations.saturating_sub(1);
                self.recycle_operation(&mut state, operation);
                continue;
            };
            let status = operation.status().unwrap_or(Err(Errno::ECANCELED));
            let transferred = operation.transferred_bytes();
            request.operation_finished(status, transferred < operation.original_length(), transferred);

            let mut notify = false;
            {
                let mut state = self.state.lock();
                state.pending_operations = state.pending_operations.saturating_sub(1);
                self.recycle_operation(&mut state, operation);
                if request.is_finished() {
                    if request.status() == Some(Ok(())) && request.remaining_bytes() > 0 {
                        // More to prepare, it stays with its owner.
                        request.set_unfinished();
                    } else {
                        Self::detach_request(&mut state, &request);
                        notify = true;
                    }
                }
            }
            if notify {
                self.deliver(request);
            }
        }
        finished_any
    }

    /// Claim the block range of a read-before-write before its read goes out. False when
    /// another merge on an overlapping range has not been written back yet.
    fn hold_merge_range(state: &mut SchedulerState, operation: &IoOperation) -> bool {
        if operation.phase() != OperationPhase::ReadBeforeWrite || state.merging.contains_key(&operation.id()) {
            return true;
        }
        let (start, end) = (operation.offset(), operation.offset() + operation.length());
        if state.merging.values().any(|&(s, e)| s < end && start < e) {
            return false;
        }
        state.merging.insert(operation.id(), (start, end));
        true
    }

    fn recycle_operation(&self, state: &mut SchedulerState, mut operation: IoOperation) {
        state.merging.remove(&operation.id());
        if let Some(buffer) = operation.recycle() {
            match self.dma.as_ref() {
                Some(dma) => dma.recycle_buffer(buffer),
                None => {
                    log_debug_assert!(false, "DMA buffer without DMA resource");
                }
            }
        }
        state.unused_operations.push(operation);
    }

    fn detach_request(state: &mut SchedulerState, request: &Arc<IoRequest>) {
        let Some(slot) = request.owner() else {
            return;
        };
        request.set_owner(None);
        let owner = &mut state.owners[slot];
        owner.remove_request(request);
        if !owner.is_active() {
            Self::retire_owner(state, slot);
        }
    }

    /// An owner without work leaves the round robin. Its slot keeps the thread mapping until
    /// another thread needs it.
    fn retire_owner(state: &mut SchedulerState, slot: usize) {
        state.active.remove(slot);
        if !state.unused_owners.contains(&slot) {
            state.unused_owners.push_back(slot);
        }
    }

    /// Fail `request` with `status`. Requests ready to be notified are pushed to `aborted`.
    fn abort_locked(
        &self, state: &mut SchedulerState, request: &Arc<IoRequest>, status: Errno,
        aborted: &mut Vec<Arc<IoRequest>>,
    ) {
        request.set_error(status);
        let Some(slot) = request.owner() else {
            return;
        };
        let queued = {
            let owner = &mut state.owners[slot];
            let (queued, rest): (VecDeque<IoOperation>, VecDeque<IoOperation>) = owner
                .operations
                .drain(..)
                .partition(|op| op.parent().is_some_and(|parent| Arc::ptr_eq(parent, request)));
            owner.operations = rest;
            owner.remove_request(request);
            queued
        };
        for mut operation in queued {
            if operation.take_parent().is_some() {
                request.operation_finished(Err(status), true, operation.transferred_bytes());
            }
            self.recycle_operation(state, operation);
        }

        if request.pending_operations() == 0 {
            request.set_owner(None);
            aborted.push(request.clone());
        } else {
            // Wait for the operations on the device.
            state.owners[slot].completed_requests.push_back(request.clone());
        }
        if !state.owners[slot].is_active() {
            Self::retire_owner(state, slot);
        }
    }

    /// Notify a finished request, on the notifier thread when it has callbacks.
    fn deliver(&self, request: Arc<IoRequest>) {
        self.stats.requests_finished.fetch_add(1, Ordering::Relaxed);
        if request.has_callbacks() {
            if let Some(notifier) = self.notifier.read().as_ref() {
                if notifier.send(request.clone()) {
                    return;
                }
            }
        }
        self.emit(EventCode::RequestFinished, Some(&request), None);
        request.notify_finished();
    }

    fn dump(&self, out: &mut String) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "scheduler {} \"{}\"", self.id, self.name)?;
        writeln!(out, "  block size:  {}", self.bandwidth.block_size)?;
        writeln!(
            out,
            "  bandwidth:   iteration {} owner {}..{}",
            self.bandwidth.iteration, self.bandwidth.min_owner, self.bandwidth.max_owner
        )?;
        match self.dma.as_ref() {
            Some(dma) => writeln!(out, "  dma:         {} buffers", dma.buffer_count())?,
            None => writeln!(out, "  dma:         -")?,
        }
        writeln!(
            out,
            "  operations:  {} total, {} unused, {} pending",
            self.operation_count,
            state.unused_operations.len(),
            state.pending_operations
        )?;
        writeln!(out, "  owners:      {} active, {} unused", state.active.len(), state.unused_owners.len())?;
        for &slot in state.active.iter() {
            state.owners[slot].dump(slot, out)?;
        }
        Ok(())
    }
}
