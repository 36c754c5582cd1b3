// Copyright (c) 2025 NaturalIO

use std::collections::VecDeque;
use std::fmt::{self, Write};
use std::sync::Arc;

use crate::request::IoRequest;
use crate::tasks::IoOperation;
use crate::threads::{IDLE_PRIORITY, TeamId, ThreadId};

/// Bookkeeping for one submitting thread.
pub(crate) struct IoRequestOwner {
    pub(crate) team: TeamId,
    /// `None` for a slot that was never handed out.
    pub(crate) thread: Option<ThreadId>,
    pub(crate) priority: i32,
    /// Requests with bytes left to prepare, FIFO.
    pub(crate) requests: VecDeque<Arc<IoRequest>>,
    /// Fully prepared requests waiting for their operations to finish.
    pub(crate) completed_requests: VecDeque<Arc<IoRequest>>,
    /// Operations that need another round, dispatched first next time.
    pub(crate) operations: VecDeque<IoOperation>,
}

impl IoRequestOwner {
    pub(crate) fn new() -> Self {
        Self {
            team: -1,
            thread: None,
            priority: IDLE_PRIORITY,
            requests: VecDeque::new(),
            completed_requests: VecDeque::new(),
            operations: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        !self.requests.is_empty() || !self.completed_requests.is_empty() || !self.operations.is_empty()
    }

    /// Whether picking this owner can produce operations.
    #[inline]
    pub(crate) fn has_schedulable_work(&self) -> bool {
        !self.requests.is_empty() || !self.operations.is_empty()
    }

    /// Drop `request` from whichever queue holds it.
    pub(crate) fn remove_request(&mut self, request: &Arc<IoRequest>) -> bool {
        for queue in [&mut self.requests, &mut self.completed_requests] {
            if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, request)) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Move the request at the head of the pending queue to the completed queue.
    pub(crate) fn complete_head(&mut self, request: &Arc<IoRequest>) {
        match self.requests.front() {
            Some(head) if Arc::ptr_eq(head, request) => {
                if let Some(head) = self.requests.pop_front() {
                    self.completed_requests.push_back(head);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn dump(&self, slot: usize, out: &mut String) -> fmt::Result {
        writeln!(out, "owner {}", slot)?;
        writeln!(out, "  team:     {}", self.team)?;
        match self.thread {
            Some(thread) => writeln!(out, "  thread:   {}", thread)?,
            None => writeln!(out, "  thread:   -")?,
        }
        writeln!(out, "  priority: {}", self.priority)?;
        writeln!(out, "  requests:")?;
        for request in self.requests.iter() {
            writeln!(out, "    {:?}", request)?;
        }
        writeln!(out, "  completed requests:")?;
        for request in self.completed_requests.iter() {
            writeln!(out, "    {:?}", request)?;
        }
        writeln!(out, "  operations:")?;
        for operation in self.operations.iter() {
            writeln!(out, "    {:?}", operation)?;
        }
        Ok(())
    }
}

/// Round robin ring of active owner slots.
///
/// The cursor plays the part of a marker entry: it remembers where the scheduler stands even
/// when the owner it stood on is removed in the meantime, in which case it rests on that
/// owner's successor and the next [ActiveOwners::advance] returns the successor.
pub(crate) struct ActiveOwners {
    slots: Vec<usize>,
    cursor: usize,
    /// The cursor sits between entries, not on one.
    detached: bool,
}

impl ActiveOwners {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), cursor: 0, detached: true }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub(crate) fn contains(&self, slot: usize) -> bool {
        self.slots.contains(&slot)
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &usize> {
        self.slots.iter()
    }

    /// New owners queue up behind everyone already waiting.
    pub(crate) fn push(&mut self, slot: usize) {
        log_debug_assert!(!self.slots.contains(&slot), "owner {} already active", slot);
        self.slots.push(slot);
    }

    pub(crate) fn remove(&mut self, slot: usize) -> bool {
        let Some(pos) = self.slots.iter().position(|&s| s == slot) else {
            return false;
        };
        self.slots.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        } else if pos == self.cursor {
            self.detached = true;
        }
        if self.slots.is_empty() {
            self.cursor = 0;
            self.detached = true;
        }
        true
    }

    /// The owner the cursor stands on.
    #[inline]
    pub(crate) fn current(&self) -> Option<usize> {
        if self.detached { None } else { self.slots.get(self.cursor).copied() }
    }

    /// Step to the next owner, wrapping around.
    pub(crate) fn advance(&mut self) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        if self.detached {
            self.detached = false;
        } else {
            self.cursor += 1;
        }
        if self.cursor >= self.slots.len() {
            self.cursor = 0;
        }
        Some(self.slots[self.cursor])
    }
}
