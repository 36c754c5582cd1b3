// Copyright (c) 2025 NaturalIO

//! Devices that execute dispatched operations.

pub mod memory;
pub mod uring;

pub use memory::{CompletionMode, Fault, MemoryDevice};
pub use uring::UringDevice;
