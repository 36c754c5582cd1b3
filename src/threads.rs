// Copyright (c) 2025 NaturalIO

use parking_lot::RwLock;
use std::collections::HashMap;

pub type TeamId = i32;
pub type ThreadId = i32;

/// Priority given to a fresh owner until the submitting thread reports one.
pub const IDLE_PRIORITY: i32 = 0;

/// What the scheduler needs to know about the threads submitting requests.
pub trait ThreadInfo: Send + Sync + 'static {
    /// IO priority of the thread, `None` when unknown.
    fn io_priority(&self, thread: ThreadId) -> Option<i32>;

    /// An idle owner slot is only handed to another thread once its thread is gone.
    fn is_alive(&self, thread: ThreadId) -> bool;
}

/// Registry of live threads and their IO priorities.
#[derive(Default)]
pub struct ThreadTable {
    threads: RwLock<HashMap<ThreadId, i32>>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread: ThreadId, io_priority: i32) {
        self.threads.write().insert(thread, io_priority);
    }

    pub fn set_io_priority(&self, thread: ThreadId, io_priority: i32) -> bool {
        match self.threads.write().get_mut(&thread) {
            Some(prio) => {
                *prio = io_priority;
                true
            }
            None => false,
        }
    }

    /// Mark the thread as exited.
    pub fn exit(&self, thread: ThreadId) {
        self.threads.write().remove(&thread);
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }
}

impl ThreadInfo for ThreadTable {
    #[inline]
    fn io_priority(&self, thread: ThreadId) -> Option<i32> {
        self.threads.read().get(&thread).copied()
    }

    #[inline]
    fn is_alive(&self, thread: ThreadId) -> bool {
        self.threads.read().contains_key(&thread)
    }
}
