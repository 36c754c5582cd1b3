// Copyright (c) 2025 NaturalIO

use std::sync::Arc;

use crossbeam::queue::SegQueue;
use crossbeam::sync::{Parker, Unparker};
use nix::errno::Errno;

use crate::tasks::IoOperation;

/// Operations handed back by the device, waiting for the finisher.
///
/// This is the only scheduler state touched from completion context, so it is lock free:
/// pushing never blocks and never takes the scheduler lock. Waking is a token, an unpark that
/// arrives before the park is not lost.
pub(crate) struct CompletionQueue {
    completed: SegQueue<IoOperation>,
    unparker: Unparker,
}

impl CompletionQueue {
    pub(crate) fn new() -> (Arc<Self>, Parker) {
        let parker = Parker::new();
        let queue = Arc::new(Self { completed: SegQueue::new(), unparker: parker.unparker().clone() });
        (queue, parker)
    }

    #[inline(always)]
    pub(crate) fn pop(&self) -> Option<IoOperation> {
        self.completed.pop()
    }

    #[inline(always)]
    pub(crate) fn has_pending(&self) -> bool {
        !self.completed.is_empty()
    }

    #[inline(always)]
    pub(crate) fn push(&self, operation: IoOperation) {
        self.completed.push(operation);
        self.unparker.unpark();
    }

    #[inline(always)]
    pub(crate) fn wake(&self) {
        self.unparker.unpark();
    }
}

/// Handle through which a device reports finished operations.
///
/// Cheap to clone, and callable from any thread, including ones that must not sleep.
#[derive(Clone)]
pub struct Completer {
    queue: Arc<CompletionQueue>,
}

impl Completer {
    pub(crate) fn new(queue: Arc<CompletionQueue>) -> Self {
        Self { queue }
    }

    /// Hand an operation back. `transferred` is the raw byte count the device moved from the
    /// operation's current offset.
    #[inline]
    pub fn operation_completed(&self, mut operation: IoOperation, status: Result<(), Errno>, transferred: u64) {
        operation.complete(status, transferred);
        self.queue.push(operation);
    }
}
