//! The consumer delivery worker.
//!
//! A dedicated thread that walks the RX storage and invokes the
//! registered callbacks for every ready message, so consumer code never
//! runs on the transport return path. One single thread keeps the
//! per-channel FIFO delivery order for free.

use std::io;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::stats::Statistics;
use crate::storage::MessageStorage;

enum Job {
    Notify,
    Shutdown,
}

pub(crate) struct DeliveryWorker {
    jobs: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryWorker {
    /// Spawn the delivery thread over a shared storage and counter set.
    pub(crate) fn spawn(
        storage: Arc<MessageStorage>,
        stats: Arc<Statistics>,
    ) -> io::Result<DeliveryWorker> {
        let (jobs, inbox) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("iccom-delivery".into())
            .spawn(move || run(inbox, storage, stats))?;
        Ok(DeliveryWorker { jobs, handle: Mutex::new(Some(handle)) })
    }

    /// Ask the worker to sweep the storage. Cheap and coalescing-safe:
    /// a redundant sweep finds nothing ready and moves on.
    pub(crate) fn schedule(&self) {
        let _ = self.jobs.send(Job::Notify);
    }

    /// Stop the thread and wait for the job in progress to finish. Any
    /// callback invocation underway completes before this returns.
    pub(crate) fn shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run(inbox: Receiver<Job>, storage: Arc<MessageStorage>, stats: Arc<Statistics>) {
    while let Ok(job) = inbox.recv() {
        match job {
            Job::Shutdown => break,
            Job::Notify => {
                let passed = storage.pass_ready_to_consumer() as u64;
                if passed > 0 {
                    stats.messages_ready_in_storage.fetch_sub(passed, Relaxed);
                    log::debug!("delivered {passed} message(s) to consumer callbacks");
                }
            }
        }
    }
}
