// Copyright (c) 2025 NaturalIO

//! Registry of live schedulers, plus an event channel for observers.
//!
//! A roster is constructed once (e.g. at storage subsystem startup) and handed to every
//! [IoScheduler] by reference. It gives out scheduler ids, keeps weak references to the
//! schedulers for [IoSchedulerRoster::dump], and fans scheduler events out to listeners.
//! Building events costs nothing while nobody listens.

use std::fmt::Write;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};

use crate::request::IoRequest;
use crate::scheduler::IoScheduler;
use crate::tasks::IoOperation;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventCode {
    /// A scheduler registered with the roster.
    Added,
    Removed,
    RequestScheduled,
    OperationStarted,
    OperationFinished,
    RequestFinished,
}

/// What an operation looked like when the event fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub id: usize,
    pub offset: u64,
    pub length: u64,
    pub status: Option<Result<(), Errno>>,
}

impl From<&IoOperation> for OperationSnapshot {
    fn from(operation: &IoOperation) -> Self {
        Self {
            id: operation.id(),
            offset: operation.offset(),
            length: operation.length(),
            status: operation.status(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerEvent {
    pub code: EventCode,
    pub scheduler: i32,
    /// Id of the request involved.
    pub request: Option<u64>,
    pub operation: Option<OperationSnapshot>,
}

impl SchedulerEvent {
    #[inline]
    pub fn new(code: EventCode, scheduler: i32) -> Self {
        Self { code, scheduler, request: None, operation: None }
    }

    #[inline]
    pub fn with_request(mut self, request: Option<&IoRequest>) -> Self {
        self.request = request.map(|r| r.id());
        self
    }

    #[inline]
    pub fn with_operation(mut self, operation: &IoOperation) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// Listeners run on whatever thread raised the event, and must not register or remove
/// listeners themselves.
pub type EventListener = Box<dyn Fn(&SchedulerEvent) + Send + Sync + 'static>;

pub struct IoSchedulerRoster {
    next_id: AtomicI32,
    next_listener: AtomicU64,
    schedulers: Mutex<Vec<(i32, Weak<IoScheduler>)>>,
    listeners: RwLock<Vec<(u64, EventListener)>>,
    listener_count: AtomicUsize,
}

impl IoSchedulerRoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI32::new(0),
            next_listener: AtomicU64::new(1),
            schedulers: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            listener_count: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub(crate) fn next_scheduler_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the id to pass to [IoSchedulerRoster::remove_listener].
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.write();
        listeners.push((id, Box::new(listener)));
        self.listener_count.store(listeners.len(), Ordering::Release);
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listener_count.store(listeners.len(), Ordering::Release);
        listeners.len() != before
    }

    #[inline(always)]
    pub fn has_listeners(&self) -> bool {
        self.listener_count.load(Ordering::Acquire) > 0
    }

    pub fn notify(&self, event: &SchedulerEvent) {
        if !self.has_listeners() {
            return;
        }
        for (_, listener) in self.listeners.read().iter() {
            listener(event);
        }
    }

    pub(crate) fn add_scheduler(&self, scheduler: &Arc<IoScheduler>) {
        let id = scheduler.id();
        {
            let mut schedulers = self.schedulers.lock();
            schedulers.retain(|(_, s)| s.strong_count() > 0);
            schedulers.push((id, Arc::downgrade(scheduler)));
        }
        debug!("roster: add scheduler {} \"{}\"", id, scheduler.name());
        self.notify(&SchedulerEvent::new(EventCode::Added, id));
    }

    pub(crate) fn remove_scheduler(&self, id: i32) -> bool {
        let removed = {
            let mut schedulers = self.schedulers.lock();
            let before = schedulers.len();
            schedulers.retain(|(scheduler_id, _)| *scheduler_id != id);
            schedulers.len() != before
        };
        if removed {
            debug!("roster: remove scheduler {}", id);
            self.notify(&SchedulerEvent::new(EventCode::Removed, id));
        }
        removed
    }

    /// The registered schedulers that are still alive.
    pub fn schedulers(&self) -> Vec<Arc<IoScheduler>> {
        self.schedulers.lock().iter().filter_map(|(_, s)| s.upgrade()).collect()
    }

    pub fn dump(&self) -> String {
        let schedulers = self.schedulers();
        let mut out = String::new();
        let _ = writeln!(out, "{} schedulers, {} listeners", schedulers.len(), self.listener_count.load(Ordering::Acquire));
        for scheduler in schedulers {
            out.push_str(&scheduler.dump());
        }
        out
    }
}
