// Copyright (c) 2025 NaturalIO

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;

use crossfire::{BlockingRxTrait, BlockingTxTrait, MTx, mpmc};
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::completion::Completer;
use crate::tasks::{DispatchError, IoCallback, IoOperation};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompletionMode {
    /// Complete inside `do_io`, like a synchronous driver.
    Inline,
    /// Complete from a worker thread, like an interrupt handler.
    Deferred,
}

/// One-shot misbehaviour for the next operation starting at a given offset.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Fault {
    Error(Errno),
    /// Transfer only this many bytes.
    Short(u64),
}

struct MemoryStore {
    data: Mutex<Vec<u8>>,
    faults: Mutex<HashMap<u64, Fault>>,
    completer: Completer,
}

impl MemoryStore {
    fn execute(&self, mut operation: IoOperation) {
        let fault = self.faults.lock().remove(&operation.offset());
        let length = operation.length() as usize;
        let (status, transferred) = match fault {
            Some(Fault::Error(errno)) => (Err(errno), 0),
            Some(Fault::Short(bytes)) => (Ok(()), (bytes as usize).min(length)),
            None => (Ok(()), length),
        };
        if transferred > 0 {
            let offset = operation.offset() as usize;
            let write = operation.is_write();
            let mut data = self.data.lock();
            let disk = &mut data[offset..offset + transferred];
            operation.with_transfer_buffer(|buf| {
                if write {
                    disk.copy_from_slice(&buf[..transferred]);
                } else {
                    buf[..transferred].copy_from_slice(disk);
                }
            });
        }
        trace!("memory: {:?} -> {:?} {}", operation, status, transferred);
        self.completer.operation_completed(operation, status, transferred as u64);
    }
}

/// A RAM disk.
pub struct MemoryDevice {
    store: Arc<MemoryStore>,
    size: u64,
    worker: Option<MTx<mpmc::Array<IoOperation>>>,
}

impl MemoryDevice {
    pub fn new(size: usize, completer: Completer, mode: CompletionMode) -> io::Result<Arc<Self>> {
        let store = Arc::new(MemoryStore {
            data: Mutex::new(vec![0u8; size]),
            faults: Mutex::new(HashMap::new()),
            completer,
        });
        let worker = match mode {
            CompletionMode::Inline => None,
            CompletionMode::Deferred => {
                let (tx, rx) = mpmc::bounded_blocking::<IoOperation>(1024);
                let _store = store.clone();
                thread::Builder::new().name("memory device".to_string()).spawn(move || {
                    loop {
                        match rx.recv() {
                            Ok(operation) => _store.execute(operation),
                            Err(_) => {
                                debug!("memory device worker exit");
                                return;
                            }
                        }
                    }
                })?;
                Some(tx)
            }
        };
        Ok(Arc::new(Self { store, size: size as u64, worker }))
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn inject_fault(&self, offset: u64, fault: Fault) {
        self.store.faults.lock().insert(offset, fault);
    }

    pub fn contents(&self, offset: u64, len: usize) -> Vec<u8> {
        let offset = offset as usize;
        self.store.data.lock()[offset..offset + len].to_vec()
    }

    pub fn fill(&self, offset: u64, src: &[u8]) {
        let offset = offset as usize;
        self.store.data.lock()[offset..offset + src.len()].copy_from_slice(src);
    }
}

impl IoCallback for MemoryDevice {
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError> {
        if operation.offset() + operation.length() > self.size {
            return Err(DispatchError(operation, Errno::EINVAL));
        }
        match self.worker.as_ref() {
            Some(tx) => tx.send(operation).map_err(|e| DispatchError(e.0, Errno::ENODEV)),
            None => {
                self.store.execute(operation);
                Ok(())
            }
        }
    }
}
