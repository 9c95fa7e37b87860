//! Package (frame) codec — the fixed-size unit the transport exchanges.
//!
//! Wire layout of a data frame of `frame_size` bytes:
//!
//! ```text
//! payload_len: u16 big-endian
//! id:          u8               (1..=255, wrapping; 0 is reserved)
//! payload:     [u8; frame_size - 7]   (packets, then 0xFF filler)
//! crc32:       u32 little-endian over bytes [0, frame_size - 4)
//! ```
//!
//! A package is *finalized* when its filler is in place and the CRC
//! trailer matches; only finalized packages ever reach the transport.

use std::fmt;

use crate::crc32::crc32;
use crate::packet::{self, PACKET_HEADER_SIZE};

/// Size of the `payload_len` field.
pub const PAYLOAD_LEN_FIELD_SIZE: usize = 2;
/// Size of the package `id` field.
pub const ID_FIELD_SIZE: usize = 1;
/// Size of the CRC trailer.
pub const CRC_FIELD_SIZE: usize = 4;
/// Bytes of a frame not available to packet data.
pub const PACKAGE_OVERHEAD: usize = PAYLOAD_LEN_FIELD_SIZE + ID_FIELD_SIZE + CRC_FIELD_SIZE;
/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = PAYLOAD_LEN_FIELD_SIZE + ID_FIELD_SIZE;

/// Value used to pad unused payload space. Enforced on both emit and
/// verify.
pub const FILLER_BYTE: u8 = 0xFF;

/// Smallest frame that can carry a packet: the package overhead plus a
/// minimal packet. Smaller frames could only ever be empty.
pub const MIN_FRAME_SIZE: usize = PACKAGE_OVERHEAD + packet::MIN_PACKET_SIZE;

// ─── Verification errors ──────────────────────────────────────────────────────

/// Why a received frame was rejected. Every variant is recovered by
/// NACKing the peer; none of them propagate upward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is too small to hold even the header and trailer.
    UndersizedFrame {
        /// Received frame size in bytes.
        size: usize,
    },
    /// The declared payload length exceeds the payload room.
    BadLength {
        /// Declared payload length.
        declared: usize,
        /// Payload room of the frame.
        room: usize,
    },
    /// A byte of unused payload space is not [`FILLER_BYTE`].
    BadFiller {
        /// Offset of the first offending byte.
        offset: usize,
    },
    /// The CRC trailer does not match the frame contents.
    BadCrc {
        /// CRC stored in the trailer.
        stored: u32,
        /// CRC computed over the frame.
        computed: u32,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndersizedFrame { size } => write!(f, "frame of {size} bytes is undersized"),
            Self::BadLength { declared, room } => {
                write!(f, "declared payload of {declared} exceeds room of {room}")
            }
            Self::BadFiller { offset } => {
                write!(f, "unused payload byte at offset {offset} is not filler")
            }
            Self::BadCrc { stored, computed } => {
                write!(f, "CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ─── Package ──────────────────────────────────────────────────────────────────

/// One fixed-size frame, owned as a byte buffer.
///
/// The TX queue mutates packages through [`Package::add_packet`] and
/// re-finalizes them; the RX path wraps received bytes with
/// [`Package::from_bytes`] and checks them with [`Package::verify`]
/// before reading anything else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    data: Vec<u8>,
}

impl Package {
    /// Allocate a finalized empty package of `frame_size` bytes carrying
    /// `id`.
    ///
    /// `frame_size` must be at least [`MIN_FRAME_SIZE`]; the engine
    /// validates its configuration before ever constructing one.
    pub fn new_empty(frame_size: usize, id: u8) -> Package {
        debug_assert!(frame_size >= MIN_FRAME_SIZE);
        let mut package = Package { data: vec![0; frame_size] };
        package.set_id(id);
        package.make_empty();
        package
    }

    /// Wrap raw received bytes. No checks are performed here; call
    /// [`Package::verify`] before trusting any field.
    pub fn from_bytes(data: Vec<u8>) -> Package {
        Package { data }
    }

    /// The full frame, e.g. for handing to the transport.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes of payload room, occupied or not.
    pub fn payload_room(&self) -> usize {
        self.data.len().saturating_sub(PACKAGE_OVERHEAD)
    }

    /// The package id.
    pub fn id(&self) -> u8 {
        self.data[PAYLOAD_LEN_FIELD_SIZE]
    }

    /// Overwrite the package id. Leaves the package un-finalized.
    pub fn set_id(&mut self, id: u8) {
        self.data[PAYLOAD_LEN_FIELD_SIZE] = id;
    }

    fn declared_payload_len(&self) -> usize {
        u16::from_be_bytes([self.data[0], self.data[1]]) as usize
    }

    /// Declared payload length, checked against the payload room.
    pub fn payload_len(&self) -> Result<usize, FrameError> {
        let declared = self.declared_payload_len();
        let room = self.payload_room();
        if declared > room {
            return Err(FrameError::BadLength { declared, room });
        }
        Ok(declared)
    }

    fn set_payload_len(&mut self, len: usize) {
        self.data[..PAYLOAD_LEN_FIELD_SIZE].copy_from_slice(&(len as u16).to_be_bytes());
    }

    /// Payload room not yet occupied by packets.
    pub fn free_space(&self) -> usize {
        self.payload_room().saturating_sub(self.declared_payload_len())
    }

    /// `true` when no packet bytes are stored.
    pub fn is_empty(&self) -> bool {
        self.declared_payload_len() == 0
    }

    /// The occupied payload area.
    ///
    /// On the receive path this is meaningful only after a successful
    /// [`Package::verify`]; the slice is clamped to the room so a broken
    /// length field cannot make it overrun the trailer.
    pub fn payload(&self) -> &[u8] {
        let len = self.declared_payload_len().min(self.payload_room());
        &self.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len]
    }

    /// Append as much of `payload` as fits, wrapped into one packet.
    ///
    /// Writes a packet header plus payload bytes after the currently
    /// occupied area and bumps the declared length. The packet's
    /// `complete` flag is set iff the whole remainder of the caller's
    /// payload fit. Returns the number of consumer bytes written; `0`
    /// means the package cannot take another packet and is ready to go.
    ///
    /// Does not finalize: filler and CRC are stale until
    /// [`Package::finalize`].
    pub fn add_packet(&mut self, payload: &[u8], channel: u16) -> usize {
        let free = self.free_space();
        if payload.is_empty() || free <= PACKET_HEADER_SIZE {
            return 0;
        }
        let write = (free - PACKET_HEADER_SIZE).min(payload.len());
        let used = self.declared_payload_len();
        let start = PAYLOAD_OFFSET + used;
        let complete = write == payload.len();

        packet::write_header(&mut self.data[start..], write, channel, complete);
        let body = start + PACKET_HEADER_SIZE;
        self.data[body..body + write].copy_from_slice(&payload[..write]);
        self.set_payload_len(used + PACKET_HEADER_SIZE + write);
        write
    }

    /// Fill the unused payload with [`FILLER_BYTE`] and rewrite the CRC
    /// trailer. After this the package satisfies [`Package::verify`].
    pub fn finalize(&mut self) {
        let fill_from = PAYLOAD_OFFSET + self.declared_payload_len();
        let crc_at = self.data.len() - CRC_FIELD_SIZE;
        self.data[fill_from..crc_at].fill(FILLER_BYTE);
        let crc = crc32(&self.data[..crc_at]);
        self.data[crc_at..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Reset to the finalized empty state, keeping size and id.
    pub fn make_empty(&mut self) {
        self.set_payload_len(0);
        self.finalize();
    }

    fn stored_crc(&self) -> u32 {
        let crc_at = self.data.len() - CRC_FIELD_SIZE;
        u32::from_le_bytes([
            self.data[crc_at],
            self.data[crc_at + 1],
            self.data[crc_at + 2],
            self.data[crc_at + 3],
        ])
    }

    /// Check the whole package-level layout: declared length within room,
    /// filler intact, CRC trailer matching. Returns the payload length.
    ///
    /// Any failure means the frame is rejected wholesale; the engine
    /// answers such frames with a NACK.
    pub fn verify(&self) -> Result<usize, FrameError> {
        if self.data.len() < PACKAGE_OVERHEAD {
            return Err(FrameError::UndersizedFrame { size: self.data.len() });
        }
        let declared = self.payload_len()?;

        let fill_from = PAYLOAD_OFFSET + declared;
        let crc_at = self.data.len() - CRC_FIELD_SIZE;
        for (i, &byte) in self.data[fill_from..crc_at].iter().enumerate() {
            if byte != FILLER_BYTE {
                return Err(FrameError::BadFiller { offset: fill_from + i });
            }
        }

        let computed = crc32(&self.data[..crc_at]);
        let stored = self.stored_crc();
        if stored != computed {
            return Err(FrameError::BadCrc { stored, computed });
        }
        Ok(declared)
    }
}
