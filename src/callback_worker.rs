// Copyright (c) 2025 NaturalIO

use std::io;
use std::sync::Arc;
use std::thread;

use crossfire::{BlockingRxTrait, BlockingTxTrait, MTx, mpmc};

use crate::request::IoRequest;
use crate::roster::{EventCode, IoSchedulerRoster, SchedulerEvent};

/// Runs request callbacks on a dedicated thread, so slow callers never hold up the scheduler.
pub(crate) struct RequestNotifier(MTx<mpmc::Array<Arc<IoRequest>>>);

impl RequestNotifier {
    pub(crate) fn new(
        name: String, depth: usize, roster: Arc<IoSchedulerRoster>, scheduler: i32,
    ) -> io::Result<(Self, thread::JoinHandle<()>)> {
        let (tx, rx) = mpmc::bounded_blocking::<Arc<IoRequest>>(depth.max(1));
        let th = thread::Builder::new().name(name).spawn(move || {
            info!("request notifier {} start", scheduler);
            loop {
                match rx.recv() {
                    Ok(request) => {
                        roster.notify(
                            &SchedulerEvent::new(EventCode::RequestFinished, scheduler).with_request(Some(&request)),
                        );
                        request.notify_finished();
                    }
                    Err(_) => {
                        info!("request notifier {} exit", scheduler);
                        return;
                    }
                }
            }
        })?;
        Ok((Self(tx), th))
    }

    /// False when the notifier is gone, the caller has to notify by itself then.
    #[inline(always)]
    pub(crate) fn send(&self, request: Arc<IoRequest>) -> bool {
        self.0.send(request).is_ok()
    }
}
