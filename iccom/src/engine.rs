//! The protocol engine: the alternating DATA/ACK state machine, recovery
//! decisions, and the public consumer API.
//!
//! Each protocol frame cycle is two transport exchanges: a DATA phase
//! where both sides swap one full-sized package, then an ACK phase where
//! both sides swap a single ack/nack byte. The engine sits between the
//! two return points of the transport and decides, for every completed
//! exchange, what goes on the wire next.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use iccom_wire::package::Package;
use iccom_wire::packet::{self, PacketIter};
use iccom_wire::{ACK_BYTE, ACK_FRAME_SIZE, MIN_FRAME_SIZE, NACK_BYTE, NO_PACKAGE_ID};

use crate::errors::Error;
use crate::report::{ErrorReporter, LinkErrorClass};
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::storage::{MessageReadyCallback, MessageStorage, ReceivedMessage};
use crate::transport::{Continuation, FullDuplex, XchangeStatus, Xfer, XferHandler};
use crate::tx_queue::TxQueue;
use crate::worker::DeliveryWorker;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Engine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Size of a data frame in bytes. Both endpoints must agree on it;
    /// must be at least [`MIN_FRAME_SIZE`] so a frame can carry a packet.
    pub frame_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config { frame_size: 64 }
    }
}

// ─── Engine core ──────────────────────────────────────────────────────────────

struct ProtocolState {
    /// `true` while the next completed exchange is a data frame; flips
    /// after every exchange. This is the only place it is written.
    data_phase: bool,
    /// Id of the last accepted package, [`NO_PACKAGE_ID`] before the
    /// first one. Re-seeing it means the peer missed our ack.
    last_rx_package_id: u8,
}

/// The shared engine state: everything the transport return points and
/// the consumer-facing API touch. Held behind an `Arc` so the transport
/// can own the handler half while [`Engine`] owns the API half.
pub(crate) struct EngineCore {
    tx: Mutex<TxQueue>,
    rx: Arc<MessageStorage>,
    state: Mutex<ProtocolState>,
    closing: AtomicBool,
    stats: Arc<Statistics>,
    reporter: ErrorReporter,
    worker: DeliveryWorker,
}

impl EngineCore {
    fn new(config: Config) -> Result<Arc<EngineCore>, Error> {
        if config.frame_size < MIN_FRAME_SIZE {
            return Err(Error::InvalidFrameSize(config.frame_size));
        }
        let rx = Arc::new(MessageStorage::new());
        let stats = Arc::new(Statistics::default());
        let worker = DeliveryWorker::spawn(Arc::clone(&rx), Arc::clone(&stats))?;
        let tx = TxQueue::new(config.frame_size);
        stats.packages_in_tx_queue.store(tx.len() as u64, Relaxed);

        Ok(Arc::new(EngineCore {
            tx: Mutex::new(tx),
            rx,
            state: Mutex::new(ProtocolState {
                data_phase: true,
                last_rx_package_id: NO_PACKAGE_ID,
            }),
            closing: AtomicBool::new(false),
            stats,
            reporter: ErrorReporter::new(),
            worker,
        }))
    }

    fn lock_tx(&self) -> MutexGuard<'_, TxQueue> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProtocolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A DATA-phase xfer carrying a copy of the current TX queue head.
    fn prepare_data_xfer(&self) -> Xfer {
        Xfer { tx: self.lock_tx().head().as_bytes().to_vec() }
    }

    /// An ACK-phase xfer: one ack or nack byte.
    fn ack_xfer(ack: bool) -> Xfer {
        Xfer { tx: vec![if ack { ACK_BYTE } else { NACK_BYTE }] }
    }

    /// Run the received data frame through verification, duplicate
    /// suppression and packet dispatch. Returns whether to ack.
    fn accept_data_frame(&self, state: &mut ProtocolState, rx: &[u8]) -> bool {
        let package = Package::from_bytes(rx.to_vec());
        let payload_len = match package.verify() {
            Ok(len) => len,
            Err(err) => {
                self.stats.packages_bad_data_received.fetch_add(1, Relaxed);
                self.reporter.report(LinkErrorClass::BadFrame, &err);
                return false;
            }
        };

        let rx_id = package.id();
        if rx_id == state.last_rx_package_id {
            // The peer never saw our ack; agree again and drop the data.
            self.stats.packages_duplicated_received.fetch_add(1, Relaxed);
            log::debug!("dropping duplicated package {rx_id}");
            return true;
        }

        if self.process_package_payload(package.payload()).is_err() {
            self.stats.packages_parsing_failed.fetch_add(1, Relaxed);
            return false;
        }

        self.stats.packages_received_ok.fetch_add(1, Relaxed);
        state.last_rx_package_id = rx_id;
        log::trace!("accepted package {rx_id} ({payload_len} payload bytes)");
        true
    }

    /// Dispatch every packet of a verified frame into the RX storage.
    /// Either the whole frame is applied and committed, or the storage
    /// is rolled back to its pre-frame state.
    fn process_package_payload(&self, payload: &[u8]) -> Result<(), ()> {
        let mut packets = 0u64;
        let mut consumer_bytes = 0u64;
        for parsed in PacketIter::new(payload) {
            match parsed {
                Ok(pkt) => {
                    self.rx.append(pkt.channel, pkt.payload, pkt.finalizing);
                    packets += 1;
                    consumer_bytes += pkt.payload.len() as u64;
                }
                Err(err) => {
                    self.rx.rollback();
                    self.reporter.report(LinkErrorClass::ParseFailed, &err);
                    return Err(());
                }
            }
        }

        let finalized = self.rx.commit() as u64;
        self.stats.packets_received_ok.fetch_add(packets, Relaxed);
        self.stats.messages_received_ok.fetch_add(finalized, Relaxed);
        self.stats.total_consumer_bytes_received_ok.fetch_add(consumer_bytes, Relaxed);
        if finalized > 0 {
            self.stats.messages_ready_in_storage.fetch_add(finalized, Relaxed);
            self.worker.schedule();
        }
        Ok(())
    }
}

impl XferHandler for EngineCore {
    fn xfer_done(&self, rx: &[u8]) -> Continuation {
        if self.closing.load(Ordering::Acquire) {
            return Continuation::Halt;
        }
        self.stats.transport_xfers_done.fetch_add(1, Relaxed);
        self.stats.raw_bytes_xfered.fetch_add(rx.len() as u64, Relaxed);

        let mut state = self.lock_state();
        if state.data_phase {
            // A data frame just completed; answer with ack or nack.
            self.stats.packages_xfered.fetch_add(1, Relaxed);
            let ack = self.accept_data_frame(&mut state, rx);
            state.data_phase = false;
            Continuation::Next { xfer: Self::ack_xfer(ack), start_immediately: true }
        } else {
            // An ack frame just completed; move to the next frame cycle,
            // advancing the queue only if the peer acked our data.
            let start_immediately = if rx.len() == ACK_FRAME_SIZE && rx[0] == ACK_BYTE {
                self.stats.packages_sent_ok.fetch_add(1, Relaxed);
                let mut tx = self.lock_tx();
                let have_more = tx.step_forward();
                self.stats.packages_in_tx_queue.store(tx.len() as u64, Relaxed);
                have_more
            } else {
                // Nack (or noise): the head goes out again unchanged.
                true
            };
            state.data_phase = true;
            Continuation::Next { xfer: self.prepare_data_xfer(), start_immediately }
        }
    }

    fn xfer_failed(&self, error: &dyn fmt::Display) -> Continuation {
        if self.closing.load(Ordering::Acquire) {
            return Continuation::Halt;
        }
        self.reporter.report(LinkErrorClass::Transport, error);

        // The link guarantees coupled duplex, so a failed exchange cannot
        // simply be retried: complete an ack cycle with a nack to put
        // both sides back in step, then the DATA phase resumes with the
        // same head package.
        let mut state = self.lock_state();
        state.data_phase = false;
        Continuation::Next { xfer: Self::ack_xfer(false), start_immediately: true }
    }
}

// ─── Public engine handle ─────────────────────────────────────────────────────

/// The ICCom protocol engine bound to a transport.
///
/// Symmetric: both endpoints run the same engine. Consumer methods may be
/// called from any thread, concurrently with the transport's exchange
/// machinery; message-ready callbacks run on a dedicated delivery thread
/// and may re-enter the engine.
pub struct Engine<T: FullDuplex> {
    core: Arc<EngineCore>,
    transport: T,
}

impl<T: FullDuplex> Engine<T> {
    /// Bind `transport` and start the protocol in the DATA phase, with
    /// one empty package queued for transmission.
    pub fn start(mut transport: T, config: Config) -> Result<Engine<T>, Error> {
        let core = EngineCore::new(config)?;
        let initial = core.prepare_data_xfer();
        let handler: Arc<dyn XferHandler> = Arc::clone(&core) as Arc<dyn XferHandler>;
        transport
            .start(handler, initial)
            .map_err(|e| Error::Transport(e.to_string()))?;
        log::info!("engine started, frame size {}", config.frame_size);
        Ok(Engine { core, transport })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.core.closing.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        Ok(())
    }

    /// Ask the transport for an exchange; an in-flight one already covers
    /// the request, so `NotReady` is success.
    fn kick(&self) -> Result<(), Error> {
        match self.transport.data_xchange(None, false) {
            XchangeStatus::Ok | XchangeStatus::NotReady => Ok(()),
            XchangeStatus::NoDevice => Err(Error::NoDevice),
        }
    }

    /// Queue `data` for transmission on `channel` and kick the transport.
    ///
    /// The bytes are copied into packet slots immediately; the caller's
    /// buffer is never retained. Messages on one channel leave in posting
    /// order.
    pub fn post_message(&self, channel: u16, data: &[u8], priority: u32) -> Result<(), Error> {
        if !packet::is_valid_channel(channel) {
            return Err(Error::InvalidChannel(channel));
        }
        if data.is_empty() {
            return Err(Error::EmptyMessage);
        }
        self.ensure_open()?;
        // priority is carried for interface compatibility, not acted upon
        let _ = priority;

        {
            let mut tx = self.core.lock_tx();
            tx.enqueue_message(data, channel);
            self.core.stats.packages_in_tx_queue.store(tx.len() as u64, Relaxed);
        }
        log::debug!("posted {} byte(s) on channel {channel:#06x}", data.len());
        self.kick()
    }

    /// Kick the transport to run a frame cycle even when the TX head is
    /// empty. Lets the peer's pending data flow during idle periods on
    /// transports that only clock on demand.
    pub fn flush(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.kick()
    }

    fn callback_slot(channel: u16) -> Result<(u16, bool), Error> {
        if channel == packet::ANY_CHANNEL {
            Ok((0, true))
        } else if packet::is_valid_channel(channel) {
            Ok((channel, false))
        } else {
            Err(Error::InvalidChannel(channel))
        }
    }

    /// Install (or replace) the message-ready callback of `channel`;
    /// [`ANY_CHANNEL`](iccom_wire::ANY_CHANNEL) installs the global
    /// fallback used by channels without their own callback.
    pub fn set_channel_callback(
        &self,
        channel: u16,
        callback: MessageReadyCallback,
    ) -> Result<(), Error> {
        let (channel, global) = Self::callback_slot(channel)?;
        self.ensure_open()?;
        self.core.rx.set_callback(channel, global, Some(callback));
        Ok(())
    }

    /// Remove the callback of `channel` (or the global fallback for
    /// [`ANY_CHANNEL`](iccom_wire::ANY_CHANNEL)). Ready messages then
    /// accumulate for [`Engine::read_message`].
    pub fn remove_channel_callback(&self, channel: u16) -> Result<(), Error> {
        let (channel, global) = Self::callback_slot(channel)?;
        self.ensure_open()?;
        self.core.rx.set_callback(channel, global, None);
        Ok(())
    }

    /// Observe the currently installed callback of `channel`.
    pub fn get_channel_callback(&self, channel: u16) -> Result<Option<MessageReadyCallback>, Error> {
        let (channel, global) = Self::callback_slot(channel)?;
        self.ensure_open()?;
        Ok(self.core.rx.get_callback(channel, global))
    }

    /// Pop the oldest ready message of `channel`, transferring ownership
    /// to the caller. `None` when nothing is ready — for poll-mode
    /// consumers that register no callback.
    pub fn read_message(&self, channel: u16) -> Result<Option<ReceivedMessage>, Error> {
        if !packet::is_valid_channel(channel) {
            return Err(Error::InvalidChannel(channel));
        }
        self.ensure_open()?;

        let message = self.core.rx.pop_first_ready(channel);
        if message.is_some() {
            let _ = self
                .core
                .stats
                .messages_ready_in_storage
                .fetch_update(Relaxed, Relaxed, |v| v.checked_sub(1));
        }
        Ok(message)
    }

    /// `true` while the engine is open and the transport is operational.
    pub fn is_running(&self) -> bool {
        !self.core.closing.load(Ordering::Acquire) && self.transport.is_running()
    }

    /// Copy out the operational counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.core.stats.snapshot()
    }

    /// The diagnostic text report: one labeled counter per line.
    pub fn statistics_report(&self) -> String {
        self.core.stats.report()
    }

    /// Log the diagnostic report at info level.
    pub fn log_statistics(&self) {
        self.core.stats.log_report();
    }

    /// Shut the engine down: fail all further API calls, halt the
    /// transport from its next return point, stop the delivery thread
    /// and drain both queues. Idempotent; concurrent calls lose the race
    /// and return without touching anything.
    ///
    /// Must not be called from within a message-ready callback: the
    /// delivery thread is joined here and cannot wait for itself.
    pub fn close(&self) {
        if self
            .core
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("engine is already closing");
            return;
        }
        log::info!("closing engine");

        self.core.worker.shutdown();
        self.transport.close();
        self.core.rx.free();

        let mut tx = self.core.lock_tx();
        tx.free_all();
        self.core.stats.packages_in_tx_queue.store(0, Relaxed);
    }
}

impl<T: FullDuplex> Drop for Engine<T> {
    fn drop(&mut self) {
        self.close();
    }
}
