// Copyright (c) 2025 NaturalIO

//! The caller side of the scheduler: one [IoRequest] per logical read or write.
//!
//! A request is shared (`Arc`) between the submitter, its owner's queues in the scheduler and
//! every [IoOperation](crate::IoOperation) carved out of it. Its byte range is consumed front to
//! back by [IoRequest::advance] as operations are prepared, and refilled with results as
//! operations finish. The request is finished when no operation is outstanding and a status has
//! been set.

use io_buffer::Buffer;
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::threads::{TeamId, ThreadId};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked by the notifier once the request is finished.
pub type RequestCallback = Box<dyn FnOnce(&IoRequest) + Send + 'static>;

/// Memory a request transfers to or from.
///
/// A user ("virtual") buffer is pinned with `mlock` before the request enters the scheduler,
/// and unpinned when the request is notified.
pub struct IoBuffer {
    data: Mutex<Buffer>,
    user: bool,
    locked: AtomicBool,
}

impl IoBuffer {
    /// Kernel side memory that never needs to be pinned.
    pub fn new(buf: Buffer) -> Self {
        Self { data: Mutex::new(buf), user: false, locked: AtomicBool::new(false) }
    }

    /// Pageable user memory, pinned for the lifetime of the request.
    pub fn user(buf: Buffer) -> Self {
        Self { data: Mutex::new(buf), user: true, locked: AtomicBool::new(false) }
    }

    #[inline(always)]
    pub fn is_virtual(&self) -> bool {
        self.user
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn lock_memory(&self) -> Result<(), Errno> {
        if self.locked.load(Ordering::Acquire) {
            return Ok(());
        }
        let data = self.data.lock();
        let ret = unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.len()) };
        if ret != 0 {
            return Err(Errno::last());
        }
        self.locked.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unlock_memory(&self) {
        if !self.locked.swap(false, Ordering::AcqRel) {
            return;
        }
        let data = self.data.lock();
        let ret = unsafe { libc::munlock(data.as_ptr() as *const libc::c_void, data.len()) };
        if ret != 0 {
            warn!("munlock failed: {}", Errno::last());
        }
    }

    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock();
        f(&data)
    }

    #[inline]
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data)
    }

    /// Give the memory back to the caller.
    pub fn into_inner(self) -> Buffer {
        self.data.into_inner()
    }
}

struct RequestState {
    /// Bytes not yet handed out to operations.
    remaining: u64,
    /// `None` while in progress.
    status: Option<Result<(), Errno>>,
    pending_children: usize,
    transferred: u64,
    partial: bool,
    owner: Option<usize>,
    notified: bool,
}

pub struct IoRequest {
    id: u64,
    team: TeamId,
    thread: ThreadId,
    offset: u64,
    length: u64,
    write: bool,
    buffer: IoBuffer,
    state: Mutex<RequestState>,
    callback: Mutex<Option<RequestCallback>>,
    has_callback: AtomicBool,
    done: Condvar,
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "request#{} {} offset={} len={} remaining={} children={} status={:?}",
            self.id,
            if self.write { "write" } else { "read" },
            self.offset,
            self.length,
            state.remaining,
            state.pending_children,
            state.status
        )
    }
}

impl IoRequest {
    pub fn new(team: TeamId, thread: ThreadId, offset: u64, buffer: IoBuffer, write: bool) -> Arc<Self> {
        let length = buffer.len() as u64;
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            team,
            thread,
            offset,
            length,
            write,
            buffer,
            state: Mutex::new(RequestState {
                remaining: length,
                status: None,
                pending_children: 0,
                transferred: 0,
                partial: false,
                owner: None,
                notified: false,
            }),
            callback: Mutex::new(None),
            has_callback: AtomicBool::new(false),
            done: Condvar::new(),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn team(&self) -> TeamId {
        self.team
    }

    #[inline(always)]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Device offset of the first byte.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline(always)]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[inline(always)]
    pub fn is_write(&self) -> bool {
        self.write
    }

    #[inline(always)]
    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    #[inline]
    pub fn remaining_bytes(&self) -> u64 {
        self.state.lock().remaining
    }

    /// Device offset of the first byte not yet handed to an operation.
    #[inline]
    pub fn current_offset(&self) -> u64 {
        self.offset + self.length - self.state.lock().remaining
    }

    pub fn advance(&self, bytes: u64) {
        let mut state = self.state.lock();
        log_debug_assert!(bytes <= state.remaining, "advance {} > remaining {}", bytes, state.remaining);
        state.remaining -= bytes.min(state.remaining);
    }

    /// Set a callback to run on the notifier thread after the request finished.
    pub fn set_callback<F>(&self, cb: F)
    where
        F: FnOnce(&IoRequest) + Send + 'static,
    {
        self.callback.lock().replace(Box::new(cb));
        self.has_callback.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn has_callbacks(&self) -> bool {
        self.has_callback.load(Ordering::Acquire)
    }

    #[inline]
    pub fn status(&self) -> Option<Result<(), Errno>> {
        self.state.lock().status
    }

    #[inline]
    pub fn has_failed(&self) -> bool {
        matches!(self.state.lock().status, Some(Err(_)))
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.status.is_some() && state.pending_children == 0
    }

    /// Net bytes moved by finished operations.
    #[inline]
    pub fn transferred_bytes(&self) -> u64 {
        self.state.lock().transferred
    }

    #[inline]
    pub fn is_partial_transfer(&self) -> bool {
        self.state.lock().partial
    }

    /// Whether notification has happened, i.e. the caller may look at the result.
    #[inline]
    pub fn is_notified(&self) -> bool {
        self.state.lock().notified
    }

    #[inline]
    pub fn pending_operations(&self) -> usize {
        self.state.lock().pending_children
    }

    #[inline]
    pub(crate) fn owner(&self) -> Option<usize> {
        self.state.lock().owner
    }

    #[inline]
    pub(crate) fn set_owner(&self, owner: Option<usize>) {
        self.state.lock().owner = owner;
    }

    #[inline]
    pub(crate) fn add_operation(&self) {
        self.state.lock().pending_children += 1;
    }

    /// Processed OK so far, but there are bytes left to schedule.
    pub(crate) fn set_unfinished(&self) {
        let mut state = self.state.lock();
        if state.status == Some(Ok(())) {
            state.status = None;
        }
    }

    /// Record a failure, which also makes the transfer partial. The first failure wins.
    pub(crate) fn set_error(&self, errno: Errno) {
        let mut state = self.state.lock();
        state.partial = true;
        match state.status {
            Some(Err(_)) => {}
            _ => state.status = Some(Err(errno)),
        }
    }

    /// One of our operations is done for good.
    ///
    /// `bytes` is the net amount it transferred, `partial` tells whether that is less than it
    /// was carved out for.
    pub(crate) fn operation_finished(&self, status: Result<(), Errno>, partial: bool, bytes: u64) {
        let mut state = self.state.lock();
        log_debug_assert!(state.pending_children > 0, "request#{} has no pending operation", self.id);
        state.pending_children = state.pending_children.saturating_sub(1);
        state.transferred += bytes;
        if status.is_err() || partial {
            state.partial = true;
        }
        if let Err(errno) = status {
            match state.status {
                Some(Err(_)) => {}
                _ => state.status = Some(Err(errno)),
            }
        }
        if state.pending_children == 0 && state.status.is_none() {
            state.status = Some(Ok(()));
        }
    }

    /// Fail a request that never made it into the scheduler.
    pub(crate) fn set_status_and_notify(&self, status: Result<(), Errno>) {
        self.state.lock().status = Some(status);
        self.notify_finished();
    }

    pub(crate) fn notify_finished(&self) {
        if self.buffer.is_virtual() {
            self.buffer.unlock_memory();
        }
        let cb = self.callback.lock().take();
        if let Some(cb) = cb {
            cb(self);
        }
        let mut state = self.state.lock();
        state.notified = true;
        self.done.notify_all();
    }

    /// Block until the request was notified, returning its final status.
    pub fn wait(&self) -> Result<(), Errno> {
        let mut state = self.state.lock();
        while !state.notified {
            self.done.wait(&mut state);
        }
        state.status.unwrap_or(Err(Errno::EINVAL))
    }

    /// Like [IoRequest::wait], `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Errno>> {
        let mut state = self.state.lock();
        if !state.notified {
            let _ = self.done.wait_while_for(&mut state, |s| !s.notified, timeout);
        }
        if state.notified { Some(state.status.unwrap_or(Err(Errno::EINVAL))) } else { None }
    }

    /// Copy out of the request buffer, `pos` relative to the request offset.
    #[inline]
    pub fn read_data(&self, pos: usize, dst: &mut [u8]) {
        self.buffer.with(|b| dst.copy_from_slice(&b[pos..pos + dst.len()]));
    }

    /// Copy into the request buffer, `pos` relative to the request offset.
    #[inline]
    pub fn write_data(&self, pos: usize, src: &[u8]) {
        self.buffer.with_mut(|b| b[pos..pos + src.len()].copy_from_slice(src));
    }
}
