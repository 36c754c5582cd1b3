// Copyright (c) 2025 NaturalIO

/// Block size used when neither the config nor the DMA resource provides one.
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Scheduling parameters of one [IoScheduler](crate::IoScheduler).
///
/// Bandwidths are given in blocks and scaled by the effective block size once the
/// scheduler knows it (the DMA resource may dictate the block size).
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// 0 means: take it from the DMA resource, or fall back to [DEFAULT_BLOCK_SIZE].
    pub block_size: u64,
    /// Number of owner slots, one per thread that may have requests in the scheduler.
    pub max_threads: usize,
    /// Number of operations to allocate when there is no DMA resource.
    /// With a DMA resource there is one operation per DMA buffer.
    pub operation_count: usize,
    /// Upper bound of bytes (in blocks) prepared in a single scheduler iteration.
    pub iteration_blocks: u64,
    /// Quantum (in blocks) granted to an owner each time it is picked.
    pub min_owner_blocks: u64,
    pub max_owner_blocks: u64,
    /// Capacity of the channel feeding the request notifier.
    pub notifier_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            max_threads: 4096,
            operation_count: 16,
            iteration_blocks: 8192,
            min_owner_blocks: 1024,
            max_owner_blocks: 4096,
            notifier_queue_depth: 4096,
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    #[inline]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    #[inline]
    pub fn with_operation_count(mut self, count: usize) -> Self {
        self.operation_count = count;
        self
    }

    /// Set the iteration ceiling and the per owner quantum, both in blocks.
    #[inline]
    pub fn with_bandwidth(mut self, iteration_blocks: u64, min_owner_blocks: u64) -> Self {
        self.iteration_blocks = iteration_blocks;
        self.min_owner_blocks = min_owner_blocks;
        if self.max_owner_blocks < min_owner_blocks {
            self.max_owner_blocks = min_owner_blocks;
        }
        self
    }

    #[inline]
    pub fn with_notifier_queue_depth(mut self, depth: usize) -> Self {
        self.notifier_queue_depth = depth;
        self
    }

    /// Resolve the block size against what the DMA resource reports.
    pub(crate) fn effective_block_size(&self, dma_block_size: Option<u64>) -> u64 {
        let size = if self.block_size > 0 { self.block_size } else { dma_block_size.unwrap_or(0) };
        if size == 0 { DEFAULT_BLOCK_SIZE } else { size }
    }
}

/// Bandwidth figures in bytes, derived from [SchedulerConfig] and the block size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bandwidth {
    pub block_size: u64,
    pub iteration: u64,
    pub min_owner: u64,
    pub max_owner: u64,
}

impl Bandwidth {
    pub(crate) fn new(config: &SchedulerConfig, block_size: u64) -> Self {
        Self {
            block_size,
            iteration: block_size * config.iteration_blocks.max(1),
            min_owner: block_size * config.min_owner_blocks.max(1),
            max_owner: block_size * config.max_owner_blocks.max(config.min_owner_blocks).max(1),
        }
    }
}
