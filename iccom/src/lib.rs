//! # iccom
//!
//! Symmetric, framed, reliable message passing between two chips over a
//! fixed-size full-duplex byte link (SPI-like).
//!
//! This crate handles:
//! * Multiplexing up to 32768 logical channels onto one link
//! * Fragmenting consumer messages into fixed-size frames and
//!   reassembling them on the far side
//! * Corruption detection (CRC-32) with a two-phase data/ack handshake,
//!   package-id duplicate suppression, and at-most-once in-order
//!   delivery per channel
//!
//! It is intentionally transport-agnostic: bring your own SPI, UART or
//! in-process link by implementing [`FullDuplex`]. The bit-exact frame
//! and packet codecs live in [`iccom_wire`], re-exported as [`wire`].
//!
//! ## Usage sketch
//!
//! Both endpoints run the same engine:
//!
//! ```text
//! let engine = Engine::start(my_spi_link, Config::default())?;
//! engine.set_channel_callback(0x1234, Arc::new(|msg| { /* consume */ }))?;
//! engine.post_message(0x1234, b"hello", 0)?;
//! ```
//!
//! Poll-mode consumers skip the callback and call
//! [`Engine::read_message`] instead.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod errors;
mod report;
mod storage;
mod tx_queue;
mod worker;
pub mod stats;
pub mod transport;

pub use iccom_wire as wire;
pub use iccom_wire::{ANY_CHANNEL, MAX_CHANNEL};

pub use engine::{Config, Engine};
pub use errors::Error;
pub use stats::{Statistics, StatisticsSnapshot};
pub use storage::{MessageReadyCallback, ReceivedMessage, INITIAL_MESSAGE_ID, INVALID_MESSAGE_ID};
pub use transport::{Continuation, FullDuplex, XchangeStatus, Xfer, XferHandler};
