//! Bit-exact wire codecs for the ICCom inter-chip protocol.
//!
//! ICCom multiplexes up to 32768 logical channels over a single fixed-size,
//! full-duplex byte link. The link exchanges *packages* (frames); each
//! package payload carries a sequence of *packets*, and each packet carries
//! part or all of one consumer message on one channel.
//!
//! This crate holds the pure codec layer:
//! * [`crc32`] — the package trailer checksum
//! * [`package`] — the fixed-size frame: length header, id, payload,
//!   filler, CRC trailer
//! * [`packet`] — the variable-length unit inside a package payload
//!
//! Everything here is deterministic and transport-free. The protocol engine
//! (queueing, reassembly, the data/ack handshake) lives in the `iccom`
//! crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crc32;
pub mod package;
pub mod packet;

pub use package::{FrameError, Package, FILLER_BYTE, MIN_FRAME_SIZE, PACKAGE_OVERHEAD};
pub use packet::{Packet, PacketError, ANY_CHANNEL, MAX_CHANNEL, PACKET_HEADER_SIZE};

/// Single-byte frame acknowledging correct receipt of a data frame.
pub const ACK_BYTE: u8 = 0xD0;

/// Single-byte frame requesting retransmission of the last data frame.
pub const NACK_BYTE: u8 = 0xE1;

/// Ack-phase frames are exactly one byte long.
pub const ACK_FRAME_SIZE: usize = 1;

/// Package id meaning "no package received yet". Never assigned to a frame.
pub const NO_PACKAGE_ID: u8 = 0;

/// First package id assigned after start and after every id wrap.
pub const INITIAL_PACKAGE_ID: u8 = 1;
