// Copyright (c) 2025 NaturalIO

use crate::completion::Completer;
use crate::tasks::{DispatchError, IoCallback, IoOperation};
use crossfire::{BlockingRxTrait, BlockingTxTrait, MTx, mpmc};
use io_uring::{IoUring, opcode, types};
use nix::errno::Errno;
use std::{
    cell::UnsafeCell,
    fs::File,
    io,
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

const URING_EXIT_SIGNAL_USER_DATA: u64 = u64::MAX;

struct UringInner(UnsafeCell<IoUring>);

unsafe impl Send for UringInner {}
unsafe impl Sync for UringInner {}

/// A file driven through io_uring, completing asynchronously from its own thread.
pub struct UringDevice {
    tx: MTx<mpmc::Array<IoOperation>>,
    file: Arc<File>,
}

impl UringDevice {
    pub fn new(file: File, depth: usize, completer: Completer) -> io::Result<Arc<Self>> {
        let depth = depth.max(2);
        let ring = IoUring::new(depth as u32)?;
        let ring_arc = Arc::new(UringInner(UnsafeCell::new(ring)));
        let inflight = Arc::new(AtomicUsize::new(0));
        let file = Arc::new(file);
        let (tx, rx) = mpmc::bounded_blocking::<IoOperation>(depth);

        let ring_submit = ring_arc.clone();
        let inflight_submit = inflight.clone();
        let file_submit = file.clone();
        thread::Builder::new().name("uring submit".to_string()).spawn(move || {
            Self::submit(rx, ring_submit, file_submit, inflight_submit, depth);
        })?;
        thread::Builder::new().name("uring complete".to_string()).spawn(move || {
            Self::complete(ring_arc, inflight, completer);
        })?;
        Ok(Arc::new(Self { tx, file }))
    }

    #[inline(always)]
    pub fn file(&self) -> &File {
        &self.file
    }

    fn submit<R: BlockingRxTrait<IoOperation>>(
        rx: R, ring_arc: Arc<UringInner>, file: Arc<File>, inflight: Arc<AtomicUsize>, depth: usize,
    ) {
        info!("io_uring submitter thread start");
        let ring = unsafe { &mut *ring_arc.0.get() };
        let fd = types::Fd(file.as_raw_fd());
        let mut operations = Vec::with_capacity(depth);
        loop {
            match rx.recv() {
                Ok(operation) => operations.push(operation),
                Err(_) => {
                    let nop_sqe = opcode::Nop::new().build().user_data(URING_EXIT_SIGNAL_USER_DATA);
                    Self::push(ring, &nop_sqe);
                    if let Err(e) = ring.submit() {
                        error!("io_uring submit error: {:?}", e);
                    }
                    info!("io_uring submitter sent exit signal");
                    break;
                }
            }
            while operations.len() < depth {
                match rx.try_recv() {
                    Ok(operation) => operations.push(operation),
                    Err(_) => break,
                }
            }

            for mut operation in operations.drain(..) {
                let (buf_ptr, buf_len) = operation.transfer_region();
                let offset = operation.offset();
                let sqe = if operation.is_write() {
                    opcode::Write::new(fd, buf_ptr, buf_len as u32).offset(offset).build()
                } else {
                    opcode::Read::new(fd, buf_ptr, buf_len as u32).offset(offset).build()
                };
                let user_data = Box::into_raw(Box::new(operation)) as u64;
                inflight.fetch_add(1, Ordering::SeqCst);
                Self::push(ring, &sqe.user_data(user_data));
            }
            if let Err(e) = ring.submit() {
                error!("io_uring submit error: {:?}", e);
            }
        }
        info!("io_uring submitter thread exit");
    }

    /// Push one entry, making room in a full submission queue first.
    fn push(ring: &mut IoUring, sqe: &io_uring::squeue::Entry) {
        loop {
            let pushed = unsafe { ring.submission().push(sqe).is_ok() };
            if pushed {
                return;
            }
            if let Err(e) = ring.submit() {
                error!("io_uring submit error: {:?}", e);
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn complete(ring_arc: Arc<UringInner>, inflight: Arc<AtomicUsize>, completer: Completer) {
        info!("io_uring completer thread start");
        let ring = unsafe { &mut *ring_arc.0.get() };
        let mut exit_received = false;
        loop {
            if exit_received && inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            match ring.submit_and_wait(1) {
                Ok(_) => {
                    let mut cq = ring.completion();
                    cq.sync();
                    for cqe in cq {
                        let user_data = cqe.user_data();
                        if user_data == URING_EXIT_SIGNAL_USER_DATA {
                            info!("io_uring completer received exit signal");
                            exit_received = true;
                            continue;
                        }
                        let operation = unsafe { Box::from_raw(user_data as *mut IoOperation) };
                        inflight.fetch_sub(1, Ordering::SeqCst);
                        let res = cqe.result();
                        if res >= 0 {
                            completer.operation_completed(*operation, Ok(()), res as u64);
                        } else {
                            completer.operation_completed(*operation, Err(Errno::from_raw(-res)), 0);
                        }
                    }
                }
                Err(e) => {
                    error!("io_uring submit_and_wait error: {:?}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        info!("io_uring completer thread exit");
    }
}

impl IoCallback for UringDevice {
    #[inline]
    fn do_io(&self, operation: IoOperation) -> Result<(), DispatchError> {
        // An sqe carries a 32 bit length.
        if operation.length() > u32::MAX as u64 {
            return Err(DispatchError(operation, Errno::EINVAL));
        }
        self.tx.send(operation).map_err(|e| DispatchError(e.0, Errno::ENODEV))
    }
}
