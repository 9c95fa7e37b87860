//! The TX package queue.
//!
//! An ordered sequence of finalized packages waiting for the peer's ack.
//! The head package is the one in flight (or queued to go next); data is
//! only ever appended to the tail. The queue holds at least one package
//! at all times, so the engine can always answer an ack phase with a
//! data frame — empty if need be.

use std::collections::VecDeque;

use iccom_wire::package::Package;
use iccom_wire::{INITIAL_PACKAGE_ID, NO_PACKAGE_ID};

pub(crate) struct TxQueue {
    packages: VecDeque<Package>,
    next_id: u8,
    frame_size: usize,
}

impl TxQueue {
    /// Create the queue with its initial empty finalized package.
    pub(crate) fn new(frame_size: usize) -> TxQueue {
        let mut queue = TxQueue {
            packages: VecDeque::new(),
            next_id: INITIAL_PACKAGE_ID,
            frame_size,
        };
        queue.enqueue_new();
        queue
    }

    /// Number of packages currently queued (≥ 1).
    pub(crate) fn len(&self) -> usize {
        self.packages.len()
    }

    /// The package to transmit next. Always finalized between queue
    /// operations.
    pub(crate) fn head(&self) -> &Package {
        // The queue is never empty; see the module invariant.
        &self.packages[0]
    }

    fn next_package_id(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            NO_PACKAGE_ID => INITIAL_PACKAGE_ID,
            n => n,
        };
        id
    }

    /// Finalize the tail (if any) and push a fresh empty package with a
    /// newly allocated id.
    fn enqueue_new(&mut self) {
        if let Some(tail) = self.packages.back_mut() {
            tail.finalize();
        }
        let id = self.next_package_id();
        self.packages.push_back(Package::new_empty(self.frame_size, id));
    }

    /// Append a message to the queue, fragmenting into as many packets
    /// and packages as needed. The tail is finalized on return, so the
    /// queue is ready for transmission at any point afterwards.
    pub(crate) fn enqueue_message(&mut self, data: &[u8], channel: u16) {
        // The head is assumed to be in active xfer; with a single
        // package resident, new data goes into a fresh tail instead.
        if self.packages.len() == 1 {
            self.enqueue_new();
        }

        let mut written = 0;
        while written < data.len() {
            let tail = self
                .packages
                .back_mut()
                .expect("TX queue holds at least one package");
            let chunk = tail.add_packet(&data[written..], channel);
            if chunk == 0 {
                // Tail cannot take another packet; spawn the next one.
                self.enqueue_new();
                continue;
            }
            written += chunk;
        }

        if let Some(tail) = self.packages.back_mut() {
            tail.finalize();
        }
    }

    /// Advance after the head package was acked.
    ///
    /// With multiple packages resident the delivered head is dropped and
    /// the next one moves up; with a single package left it is emptied
    /// in place and given a fresh id. Returns `true` when a non-empty
    /// package is pending, i.e. the transport should keep clocking.
    pub(crate) fn step_forward(&mut self) -> bool {
        if self.packages.len() > 1 {
            self.packages.pop_front();
            return true;
        }
        let id = self.next_package_id();
        let head = self
            .packages
            .front_mut()
            .expect("TX queue holds at least one package");
        head.set_id(id);
        head.make_empty();
        false
    }

    /// Drop every queued package. Only valid during shutdown, after all
    /// external callers are fenced out; the ≥ 1 invariant no longer
    /// holds afterwards.
    pub(crate) fn free_all(&mut self) {
        self.packages.clear();
    }
}
