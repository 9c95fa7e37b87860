//! Error types for the engine's public API.
//!
//! Receive-side protocol failures (bad CRC, broken packets, duplicates)
//! never surface here: the engine recovers them on the link with
//! NACK/ACK answers and only counts them in the statistics.

use std::{fmt, io};

/// The error type returned from every public engine method.
#[derive(Debug)]
pub enum Error {
    /// Channel outside `0..=0x7FFF` (and not `ANY_CHANNEL` where the
    /// operation accepts it).
    InvalidChannel(u16),
    /// Refusing to post a zero-length message.
    EmptyMessage,
    /// The configured frame size cannot carry a single packet.
    InvalidFrameSize(usize),
    /// The engine is shutting down; no further calls are served.
    Closing,
    /// The transport reports that no device is attached.
    NoDevice,
    /// The transport failed to start.
    Transport(String),
    /// Engine-internal I/O failure (e.g. the delivery thread could not
    /// be spawned).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChannel(ch)   => write!(f, "invalid channel {ch:#06x}"),
            Self::EmptyMessage         => write!(f, "empty message"),
            Self::InvalidFrameSize(sz) => write!(f, "frame size {sz} cannot carry a packet"),
            Self::Closing              => write!(f, "engine is closing"),
            Self::NoDevice             => write!(f, "no transport device"),
            Self::Transport(s)         => write!(f, "transport error: {s}"),
            Self::Io(e)                => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}
