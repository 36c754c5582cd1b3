// Copyright (c) 2025 NaturalIO

//! # DMA translation
//!
//! A [DmaResource] turns the next chunk of a request into a device ready [IoOperation],
//! bounded by the quantum the scheduler grants and by what the hardware can take in one go.
//!
//! [DmaPool] is the bounce buffer implementation: it owns a fixed set of aligned buffers and
//! widens every operation to block boundaries.
//!
//! - **Read**: the device fills the bounce buffer, the operation copies the original range
//!   back into the request when it finishes.
//! - **Aligned write**: the request data is copied into the bounce buffer up front.
//! - **Partial block write**: the operation starts with a read-before-write phase that loads the
//!   surrounding blocks, then merges the caller data and writes the whole range.
//!
//! Running out of buffers is reported as `EBUSY`, which the scheduler treats as "try again in
//! the next iteration".

use std::sync::Arc;

use io_buffer::Buffer;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::request::IoRequest;
use crate::tasks::{IoOperation, OperationPhase};

/// Transfer memory owned by a [DmaResource], lent to one operation at a time.
pub struct DmaBuffer {
    index: usize,
    data: Buffer,
}

impl DmaBuffer {
    pub fn new(index: usize, data: Buffer) -> Self {
        Self { index, data }
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

pub trait DmaResource: Send + Sync + 'static {
    fn buffer_count(&self) -> usize;

    fn block_size(&self) -> u64;

    /// Set up `operation` for the next chunk of `request`, at most `max_length` device bytes.
    ///
    /// On success the operation is attached to the request and the request advanced past the
    /// chunk. `EBUSY` means a resource is temporarily exhausted, any other error is fatal for
    /// the request. On error neither the request nor the operation may have been touched.
    fn translate_next(
        &self, request: &Arc<IoRequest>, operation: &mut IoOperation, max_length: u64,
    ) -> Result<(), Errno>;

    fn recycle_buffer(&self, buffer: DmaBuffer);
}

pub struct DmaPool {
    block_size: u64,
    buffer_size: u64,
    count: usize,
    free: Mutex<Vec<DmaBuffer>>,
}

impl DmaPool {
    /// `buffer_size` is the most a single operation may transfer, a multiple of `block_size`.
    pub fn new(count: usize, buffer_size: u64, block_size: u64) -> Result<Self, Errno> {
        if block_size == 0 || buffer_size < block_size || buffer_size % block_size != 0 {
            return Err(Errno::EINVAL);
        }
        let mut free = Vec::with_capacity(count);
        for index in 0..count {
            let data = Buffer::aligned(buffer_size as i32).map_err(|_| Errno::ENOMEM)?;
            free.push(DmaBuffer::new(index, data));
        }
        Ok(Self { block_size, buffer_size, count, free: Mutex::new(free) })
    }

    #[inline(always)]
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl DmaResource for DmaPool {
    #[inline(always)]
    fn buffer_count(&self) -> usize {
        self.count
    }

    #[inline(always)]
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn translate_next(
        &self, request: &Arc<IoRequest>, operation: &mut IoOperation, max_length: u64,
    ) -> Result<(), Errno> {
        let remaining = request.remaining_bytes();
        if remaining == 0 {
            return Err(Errno::EINVAL);
        }
        let block = self.block_size;
        log_debug_assert!(max_length >= block, "max_length {} < block {}", max_length, block);
        let budget = (max_length.min(self.buffer_size) / block * block).max(block);

        let offset = request.current_offset();
        let aligned_start = offset / block * block;
        let partial_begin = offset - aligned_start;
        let length = remaining.min(budget - partial_begin);
        let aligned_end = (offset + length).div_ceil(block) * block;

        let mut buffer = match self.free.lock().pop() {
            Some(buffer) => buffer,
            None => return Err(Errno::EBUSY),
        };
        let phase = if !request.is_write() {
            OperationPhase::Read
        } else if partial_begin != 0 || aligned_end != offset + length {
            OperationPhase::ReadBeforeWrite
        } else {
            let pos = (offset - request.offset()) as usize;
            request.read_data(pos, &mut buffer.as_mut_slice()[..length as usize]);
            OperationPhase::Write
        };
        trace!(
            "dma: request#{} {}+{} -> {}+{} {:?}",
            request.id(),
            offset,
            length,
            aligned_start,
            aligned_end - aligned_start,
            phase
        );
        operation.set_parent(request.clone());
        operation.set_phase(phase);
        operation.set_range(aligned_start, aligned_end - aligned_start);
        operation.set_original_range(offset, length);
        operation.set_buffer(buffer);
        request.advance(length);
        Ok(())
    }

    #[inline]
    fn recycle_buffer(&self, buffer: DmaBuffer) {
        let mut free = self.free.lock();
        log_debug_assert!(free.len() < self.count, "recycled more buffers than allocated");
        free.push(buffer);
    }
}
