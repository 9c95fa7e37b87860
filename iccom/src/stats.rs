//! Operational statistics.
//!
//! Monitoring data only: counters are maintained with relaxed atomics
//! and are not mutually consistent — a snapshot taken mid-frame may show
//! a package counted as xfered but not yet as received-ok. Never build
//! protocol decisions on these values.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Live engine counters.
#[derive(Default)]
pub struct Statistics {
    pub(crate) transport_xfers_done: AtomicU64,
    pub(crate) raw_bytes_xfered: AtomicU64,
    pub(crate) packages_xfered: AtomicU64,
    pub(crate) packages_sent_ok: AtomicU64,
    pub(crate) packages_received_ok: AtomicU64,
    pub(crate) packages_bad_data_received: AtomicU64,
    pub(crate) packages_duplicated_received: AtomicU64,
    pub(crate) packages_parsing_failed: AtomicU64,
    pub(crate) packages_in_tx_queue: AtomicU64,
    pub(crate) packets_received_ok: AtomicU64,
    pub(crate) messages_received_ok: AtomicU64,
    pub(crate) messages_ready_in_storage: AtomicU64,
    pub(crate) total_consumer_bytes_received_ok: AtomicU64,
}

/// A plain copy of all counters at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Exchanges completed by the transport, data and ack frames alike.
    pub transport_xfers_done: u64,
    /// Raw bytes moved by the transport in one direction.
    pub raw_bytes_xfered: u64,
    /// Data frames exchanged, good or bad.
    pub packages_xfered: u64,
    /// Data frames of ours the peer acked.
    pub packages_sent_ok: u64,
    /// Data frames of the peer we accepted.
    pub packages_received_ok: u64,
    /// Received frames rejected for CRC or layout violations.
    pub packages_bad_data_received: u64,
    /// Received frames dropped as duplicates (already-seen package id).
    pub packages_duplicated_received: u64,
    /// Verified frames whose packet data failed to parse.
    pub packages_parsing_failed: u64,
    /// Packages currently resident in the TX queue.
    pub packages_in_tx_queue: u64,
    /// Packets accepted into the RX storage.
    pub packets_received_ok: u64,
    /// Messages fully reassembled.
    pub messages_received_ok: u64,
    /// Ready messages not yet delivered or read.
    pub messages_ready_in_storage: u64,
    /// Consumer payload bytes accepted (headers excluded).
    pub total_consumer_bytes_received_ok: u64,
}

impl StatisticsSnapshot {
    /// Data frames of ours the peer has not (yet) acked.
    pub fn packages_sent_fail(&self) -> u64 {
        self.packages_xfered.saturating_sub(self.packages_sent_ok)
    }

    /// Data frames of the peer we did not accept.
    pub fn packages_received_fail(&self) -> u64 {
        self.packages_xfered.saturating_sub(self.packages_received_ok)
    }
}

impl Statistics {
    /// Copy out all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            transport_xfers_done: self.transport_xfers_done.load(Relaxed),
            raw_bytes_xfered: self.raw_bytes_xfered.load(Relaxed),
            packages_xfered: self.packages_xfered.load(Relaxed),
            packages_sent_ok: self.packages_sent_ok.load(Relaxed),
            packages_received_ok: self.packages_received_ok.load(Relaxed),
            packages_bad_data_received: self.packages_bad_data_received.load(Relaxed),
            packages_duplicated_received: self.packages_duplicated_received.load(Relaxed),
            packages_parsing_failed: self.packages_parsing_failed.load(Relaxed),
            packages_in_tx_queue: self.packages_in_tx_queue.load(Relaxed),
            packets_received_ok: self.packets_received_ok.load(Relaxed),
            messages_received_ok: self.messages_received_ok.load(Relaxed),
            messages_ready_in_storage: self.messages_ready_in_storage.load(Relaxed),
            total_consumer_bytes_received_ok: self.total_consumer_bytes_received_ok.load(Relaxed),
        }
    }

    /// Render the counters as the diagnostic text report: one labeled
    /// decimal per line, in the order tooling expects.
    pub fn report(&self) -> String {
        let s = self.snapshot();
        format!(
            "transport_layer: xfers done:  {}\n\
             transport_layer: bytes xfered:  {}\n\
             packages: xfered total:  {}\n\
             packages: sent ok:  {}\n\
             packages: received ok:  {}\n\
             packages: sent fail (total):  {}\n\
             packages: received fail (total):  {}\n\
             packages:     received corrupted:  {}\n\
             packages:     received duplicated:  {}\n\
             packages:     detailed parsing failed:  {}\n\
             packages: in tx queue:  {}\n\
             packets: received ok:  {}\n\
             messages: received ok:  {}\n\
             messages: ready rx:  {}\n\
             bandwidth: consumer bytes received:  {}\n",
            s.transport_xfers_done,
            s.raw_bytes_xfered,
            s.packages_xfered,
            s.packages_sent_ok,
            s.packages_received_ok,
            s.packages_sent_fail(),
            s.packages_received_fail(),
            s.packages_bad_data_received,
            s.packages_duplicated_received,
            s.packages_parsing_failed,
            s.packages_in_tx_queue,
            s.packets_received_ok,
            s.messages_received_ok,
            s.messages_ready_in_storage,
            s.total_consumer_bytes_received_ok,
        )
    }

    /// Log the full report at info level, line by line.
    pub fn log_report(&self) {
        for line in self.report().lines() {
            log::info!("{line}");
        }
    }
}
