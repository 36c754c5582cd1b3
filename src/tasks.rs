// Copyright (c) 2025 NaturalIO

use std::fmt;
use std::sync::Arc;

use nix::errno::Errno;

use crate::dma::DmaBuffer;
use crate::request::IoRequest;

/// What the device is asked to do with an operation's current range.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperationPhase {
    Read,
    Write,
    /// Fill the block aligned bounce buffer before a partial block write.
    ReadBeforeWrite,
}

/// A single hardware sized transfer, carved out of one [IoRequest].
///
/// Operations are moved, never shared: at any time one sits in the scheduler's unused pool,
/// in an owner's retry list, in the completed queue, or is owned by the device that runs it.
/// The device hands it back with [Completer::operation_completed](crate::Completer::operation_completed).
///
/// Two ranges are tracked. `offset`/`length` is what the device transfers now, which may be
/// widened to block boundaries and shrinks when a short transfer is continued. The original
/// range is the part of the request this operation is responsible for.
pub struct IoOperation {
    id: usize,
    parent: Option<Arc<IoRequest>>,
    phase: OperationPhase,
    offset: u64,
    length: u64,
    /// Device offset mapping to the start of the transfer memory, and its full extent.
    base_offset: u64,
    base_length: u64,
    original_offset: u64,
    original_length: u64,
    status: Option<Result<(), Errno>>,
    last_transfer: u64,
    transferred: u64,
    buffer: Option<DmaBuffer>,
    iteration: u64,
}

impl fmt::Debug for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "op#{} {:?} offset={} len={} original={}+{} transferred={} status={:?}",
            self.id,
            self.phase,
            self.offset,
            self.length,
            self.original_offset,
            self.original_length,
            self.transferred,
            self.status
        )?;
        if let Some(parent) = self.parent.as_ref() {
            write!(f, " request#{}", parent.id())?;
        }
        Ok(())
    }
}

impl IoOperation {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            parent: None,
            phase: OperationPhase::Read,
            offset: 0,
            length: 0,
            base_offset: 0,
            base_length: 0,
            original_offset: 0,
            original_length: 0,
            status: None,
            last_transfer: 0,
            transferred: 0,
            buffer: None,
            iteration: 0,
        }
    }

    /// Stable for the lifetime of the scheduler, for diagnostics.
    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn parent(&self) -> Option<&Arc<IoRequest>> {
        self.parent.as_ref()
    }

    /// Attach to a request. Every attached operation is outstanding on the request until the
    /// scheduler reports it finished.
    pub fn set_parent(&mut self, request: Arc<IoRequest>) {
        log_debug_assert!(self.parent.is_none(), "op#{} already attached", self.id);
        request.add_operation();
        self.parent = Some(request);
    }

    #[inline(always)]
    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    #[inline(always)]
    pub fn set_phase(&mut self, phase: OperationPhase) {
        self.phase = phase;
    }

    /// True when the device has to write the current range.
    #[inline(always)]
    pub fn is_write(&self) -> bool {
        self.phase == OperationPhase::Write
    }

    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline(always)]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Set the device range. It also becomes the range backed by the transfer memory.
    pub fn set_range(&mut self, offset: u64, length: u64) {
        self.offset = offset;
        self.length = length;
        self.base_offset = offset;
        self.base_length = length;
    }

    #[inline(always)]
    pub fn original_offset(&self) -> u64 {
        self.original_offset
    }

    #[inline(always)]
    pub fn original_length(&self) -> u64 {
        self.original_length
    }

    pub fn set_original_range(&mut self, offset: u64, length: u64) {
        self.original_offset = offset;
        self.original_length = length;
    }

    #[inline(always)]
    pub fn buffer(&self) -> Option<&DmaBuffer> {
        self.buffer.as_ref()
    }

    #[inline(always)]
    pub fn set_buffer(&mut self, buffer: DmaBuffer) {
        self.buffer = Some(buffer);
    }

    #[inline(always)]
    pub(crate) fn take_buffer(&mut self) -> Option<DmaBuffer> {
        self.buffer.take()
    }

    /// `None` until the device reported completion.
    #[inline(always)]
    pub fn status(&self) -> Option<Result<(), Errno>> {
        self.status
    }

    /// Net bytes of the original range moved so far.
    #[inline(always)]
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred
    }

    /// Scheduler iteration that dispatched the operation last.
    #[inline(always)]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[inline(always)]
    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    /// Prepare the operation to cover all that is left of `request` in one go, transferring
    /// straight from the request's buffer.
    pub(crate) fn prepare(&mut self, request: &Arc<IoRequest>) -> Result<(), Errno> {
        let remaining = request.remaining_bytes();
        if remaining == 0 {
            return Err(Errno::EINVAL);
        }
        let offset = request.current_offset();
        self.set_parent(request.clone());
        self.phase = if request.is_write() { OperationPhase::Write } else { OperationPhase::Read };
        self.set_range(offset, remaining);
        self.set_original_range(offset, remaining);
        Ok(())
    }

    /// Run `f` over the memory of the current device range.
    ///
    /// That is the bounce buffer when the DMA resource gave us one, or the matching part of
    /// the request's buffer otherwise.
    pub fn with_transfer_buffer<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let start = (self.offset - self.base_offset) as usize;
        let end = start + self.length as usize;
        if let Some(buffer) = self.buffer.as_mut() {
            return f(&mut buffer.as_mut_slice()[start..end]);
        }
        match self.parent.as_ref() {
            Some(parent) => {
                let pos = (self.base_offset - parent.offset()) as usize;
                parent.buffer().with_mut(|b| f(&mut b[pos + start..pos + end]))
            }
            None => f(&mut []),
        }
    }

    /// Address of the memory for the current range, for devices that hand it to the kernel.
    ///
    /// The address stays valid while the operation is in flight: neither bounce buffers nor
    /// request buffers move or resize.
    pub fn transfer_region(&mut self) -> (*mut u8, usize) {
        self.with_transfer_buffer(|b| (b.as_mut_ptr(), b.len()))
    }

    /// Record the device's result. `transferred` counts raw bytes from the current offset,
    /// only the part inside the original range counts as net. The read of a read-before-write
    /// moves nothing of the caller's, so it never counts.
    pub(crate) fn complete(&mut self, status: Result<(), Errno>, transferred: u64) {
        let transferred = transferred.min(self.length);
        self.status = Some(status);
        self.last_transfer = transferred;
        if self.phase == OperationPhase::ReadBeforeWrite {
            self.transferred = 0;
            return;
        }
        let original_end = self.original_offset + self.original_length;
        let end = (self.offset + transferred).clamp(self.original_offset, original_end);
        self.transferred = end - self.original_offset;
    }

    /// Decide whether the operation is done, after the device completed it.
    ///
    /// Returns false when another round is needed: the rest of a short transfer, or the write
    /// phase after a read-before-write. The operation is re-armed for that round.
    pub fn finish(&mut self) -> bool {
        let status = match self.status {
            Some(status) => status,
            None => {
                log_debug_assert!(false, "{:?} finish before completion", self);
                return true;
            }
        };
        if status.is_err() {
            return true;
        }
        let end = self.offset + self.length;
        if self.last_transfer > 0 && self.offset + self.last_transfer < end {
            trace!("{:?} short transfer, continue", self);
            self.offset += self.last_transfer;
            self.length = end - self.offset;
            self.status = None;
            self.last_transfer = 0;
            return false;
        }
        match self.phase {
            OperationPhase::ReadBeforeWrite => {
                if self.last_transfer == 0 {
                    self.status = Some(Err(Errno::EIO));
                    return true;
                }
                self.merge_write_data();
                self.phase = OperationPhase::Write;
                self.offset = self.base_offset;
                self.length = self.base_length;
                self.status = None;
                self.last_transfer = 0;
                self.transferred = 0;
                false
            }
            OperationPhase::Read => {
                self.copy_read_data();
                true
            }
            OperationPhase::Write => true,
        }
    }

    /// Overlay the caller's bytes onto the block data we just read.
    fn merge_write_data(&mut self) {
        let (Some(parent), Some(buffer)) = (self.parent.as_ref(), self.buffer.as_mut()) else {
            return;
        };
        let start = (self.original_offset - self.base_offset) as usize;
        let len = self.original_length as usize;
        let pos = (self.original_offset - parent.offset()) as usize;
        parent.read_data(pos, &mut buffer.as_mut_slice()[start..start + len]);
    }

    /// Hand read data from the bounce buffer to the request.
    fn copy_read_data(&mut self) {
        let (Some(parent), Some(buffer)) = (self.parent.as_ref(), self.buffer.as_ref()) else {
            return;
        };
        let start = (self.original_offset - self.base_offset) as usize;
        let len = self.transferred as usize;
        let pos = (self.original_offset - parent.offset()) as usize;
        parent.write_data(pos, &buffer.as_slice()[start..start + len]);
    }

    #[inline(always)]
    pub(crate) fn take_parent(&mut self) -> Option<Arc<IoRequest>> {
        self.parent.take()
    }

    /// Reset to the unused state, handing back the DMA buffer if there is one.
    pub(crate) fn recycle(&mut self) -> Option<DmaBuffer> {
        let buffer = self.buffer.take();
        let id = self.id;
        *self = Self::new(id);
        buffer
    }
}

/// Returned by a device that cannot take an operation. The scheduler completes the operation
/// with the given status.
pub struct DispatchError(pub IoOperation, pub Errno);

impl fmt::Debug for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dispatch of {:?} failed: {}", self.0, self.1)
    }
}

/// The device side of the scheduler: executes one operation.
///
/// The call may finish the transfer synchronously or only start it. Either way the operation
/// must come back through [Completer::operation_completed](crate::Completer::operation_completed),
/// possibly from another thread.
pub trait IoCallback: Send + Sync + 'static {
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError>;
}

/// Closure adapter for [IoCallback]
pub struct ClosureCallback(pub Box<dyn Fn(IoOperation) -> Result<(), DispatchError> + Send + Sync + 'static>);

impl IoCallback for ClosureCallback {
    #[inline]
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError> {
        (self.0)(operation)
    }
}
