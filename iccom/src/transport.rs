//! Pluggable full-duplex transport layer.
//!
//! Implement [`FullDuplex`] over SPI, a UART pair, shared memory, or an
//! in-process test link to get the ICCom framing and reliability layer
//! for free.
//!
//! The engine and transport drive each other in a strict ping-pong: the
//! engine hands the transport one prepared [`Xfer`], the transport clocks
//! it against the peer's bytes and reports back through [`XferHandler`],
//! and the handler's return value is the next xfer. The two handler
//! methods are *return points*, not events: the transport must never
//! invoke them concurrently (with themselves or each other).

use std::fmt;
use std::sync::Arc;

/// One full-duplex exchange prepared by the engine.
///
/// `tx` holds a full copy of the frame to clock out, so the transport may
/// keep the descriptor for as long as the exchange takes; the peer's bytes
/// arrive in the same exchange and come back through
/// [`XferHandler::xfer_done`] with exactly `tx.len()` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xfer {
    /// Bytes to transmit.
    pub tx: Vec<u8>,
}

impl Xfer {
    /// Exchange size in bytes (both directions).
    pub fn size(&self) -> usize {
        self.tx.len()
    }
}

/// Status of a [`FullDuplex::data_xchange`] request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XchangeStatus {
    /// The exchange was started, or was already pending and will run.
    Ok,
    /// An exchange is in flight; the request is absorbed by it. Benign.
    NotReady,
    /// No underlying device is attached.
    NoDevice,
}

/// What the transport should do after a return point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// Perform `xfer` next. When `start_immediately` is set the transport
    /// clocks it out at once; otherwise it may idle until the peer or a
    /// consumer kick initiates the exchange.
    Next {
        /// The prepared exchange.
        xfer: Xfer,
        /// Start without waiting for an external trigger.
        start_immediately: bool,
    },
    /// Stop the transport. Returned once the engine is closing; the
    /// transport must not call the handler again afterwards.
    Halt,
}

/// Engine-side return points, invoked by the transport when an exchange
/// finishes or fails.
///
/// Contract: invocations are serialized. Consumer threads may call into
/// the engine concurrently with these, but the transport itself must wait
/// for one return point to return before entering the next.
pub trait XferHandler: Send + Sync {
    /// The exchange completed; `rx` holds the peer's bytes.
    fn xfer_done(&self, rx: &[u8]) -> Continuation;

    /// The exchange failed on the transport layer.
    fn xfer_failed(&self, error: &dyn fmt::Display) -> Continuation;
}

/// A symmetric full-duplex byte-level device (SPI-like).
///
/// `data_xchange` and `close` take `&self`: implementations need interior
/// mutability anyway, since consumer threads kick the transport
/// concurrently with the exchange machinery.
pub trait FullDuplex {
    /// The error type returned by [`FullDuplex::start`] and
    /// [`FullDuplex::reset`].
    type Error: std::error::Error + Send + Sync + 'static;

    /// Bind `handler` and begin operation with `initial` as the first
    /// pending exchange.
    fn start(&mut self, handler: Arc<dyn XferHandler>, initial: Xfer) -> Result<(), Self::Error>;

    /// Request the next exchange. `replacement`, when given, supersedes
    /// the pending xfer; `start_immediately` asks to clock it out now
    /// rather than on the next external trigger.
    fn data_xchange(&self, replacement: Option<Xfer>, start_immediately: bool) -> XchangeStatus;

    /// `true` while the device is operational.
    fn is_running(&self) -> bool;

    /// Re-synchronize the link and restart from `initial`.
    fn reset(&mut self, initial: Xfer) -> Result<(), Self::Error>;

    /// Stop the device. No handler invocations may happen after this
    /// returns.
    fn close(&self);
}
