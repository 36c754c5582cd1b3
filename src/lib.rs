//! # io-scheduler
//!
//! A block IO request scheduler: requests from many threads are split into hardware sized
//! operations, shared out round robin so no thread starves the others, sorted into elevator
//! sweeps, and handed to a device that completes them asynchronously.
//!
//! ```text
//! IoRequest --schedule_request--> owner queues --scheduler thread--> elevator sort
//!     ^                                                                   |
//!     |                                                                 do_io
//!  notifier <-- finisher <-- completed queue <-- operation_completed <-- device
//! ```
//!
//! Start with [IoScheduler], [IoRequest] and one of the devices in [driver].

#[macro_use]
extern crate log;
#[macro_use]
extern crate captains_log;

mod callback_worker;
pub mod completion;
pub mod config;
pub mod dma;
pub mod driver;
pub mod elevator;
mod owner;
pub mod request;
pub mod roster;
pub mod scheduler;
pub mod tasks;
pub mod threads;

pub use completion::Completer;
pub use config::{Bandwidth, DEFAULT_BLOCK_SIZE, SchedulerConfig};
pub use dma::{DmaBuffer, DmaPool, DmaResource};
pub use elevator::{Extent, elevator_sort, elevator_sweeps};
pub use request::{IoBuffer, IoRequest, RequestCallback};
pub use roster::{EventCode, EventListener, IoSchedulerRoster, OperationSnapshot, SchedulerEvent};
pub use scheduler::{IoScheduler, SchedulerStats};
pub use tasks::{ClosureCallback, DispatchError, IoCallback, IoOperation, OperationPhase};
pub use threads::{IDLE_PRIORITY, TeamId, ThreadId, ThreadInfo, ThreadTable};

#[cfg(test)]
mod test;
