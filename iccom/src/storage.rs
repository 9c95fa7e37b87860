//! The RX message storage.
//!
//! Per-channel FIFOs of incoming messages, reassembled packet by packet.
//! Appends within one frame stay *uncommitted* until the whole frame
//! parses: [`MessageStorage::commit`] seals them, and
//! [`MessageStorage::rollback`] reverts the storage to its exact state
//! before the frame started appending, so a re-received frame can never
//! duplicate bytes.
//!
//! Consumer contract: unfinalized messages are never touched from
//! outside the engine; ready messages leave the storage exactly once,
//! either through [`MessageStorage::pop_first_ready`] or through a
//! registered callback.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Message ids of value 0 are reserved as "invalid".
pub const INVALID_MESSAGE_ID: u32 = 0;

/// First local message id allocated on a channel.
pub const INITIAL_MESSAGE_ID: u32 = 1;

/// A fully reassembled message, handed to the consumer by value.
///
/// Ownership of `data` transfers with the struct: keep it or drop it,
/// the engine has already forgotten it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// The channel the message arrived on.
    pub channel: u16,
    /// Locally assigned per-channel id; a diagnostic tag, never carried
    /// on the wire. Starts at [`INITIAL_MESSAGE_ID`] and wraps past 0.
    pub id: u32,
    /// The message bytes.
    pub data: Vec<u8>,
}

/// Callback invoked off the transport path for every ready message.
///
/// May freely re-enter the engine (e.g. post a reply): no engine lock is
/// held across the invocation.
pub type MessageReadyCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

struct MessageBuf {
    id: u32,
    data: Vec<u8>,
    uncommitted_len: usize,
    finalized: bool,
}

impl MessageBuf {
    fn new(id: u32) -> MessageBuf {
        MessageBuf { id, data: Vec::new(), uncommitted_len: 0, finalized: false }
    }

    fn is_ready(&self) -> bool {
        self.finalized && self.uncommitted_len == 0
    }
}

struct ChannelRec {
    messages: VecDeque<MessageBuf>,
    last_message_id: u32,
    callback: Option<MessageReadyCallback>,
}

impl ChannelRec {
    fn new() -> ChannelRec {
        ChannelRec {
            messages: VecDeque::new(),
            last_message_id: INVALID_MESSAGE_ID,
            callback: None,
        }
    }

    fn next_message_id(&mut self) -> u32 {
        let next = if self.messages.is_empty() {
            INITIAL_MESSAGE_ID
        } else {
            match self.last_message_id.wrapping_add(1) {
                INVALID_MESSAGE_ID => INITIAL_MESSAGE_ID,
                n => n,
            }
        };
        self.last_message_id = next;
        next
    }

    fn has_no_data(&self) -> bool {
        self.messages.is_empty() && self.callback.is_none()
    }

    fn rollback(&mut self) {
        for msg in &mut self.messages {
            if msg.uncommitted_len == 0 {
                continue;
            }
            msg.data.truncate(msg.data.len() - msg.uncommitted_len);
            msg.uncommitted_len = 0;
            msg.finalized = false;
        }
        // Messages born within the failed frame are now empty husks;
        // dropping them restores the exact pre-frame state.
        self.messages.retain(|msg| !msg.data.is_empty());
    }

    fn commit(&mut self) {
        for msg in &mut self.messages {
            msg.uncommitted_len = 0;
        }
    }
}

#[derive(Default)]
struct Channels {
    map: HashMap<u16, ChannelRec>,
    global_callback: Option<MessageReadyCallback>,
}

/// The storage proper: a channel map behind one mutex plus the atomic
/// count of finalized-but-uncommitted messages of the current frame.
pub(crate) struct MessageStorage {
    channels: Mutex<Channels>,
    uncommitted_finalized: AtomicUsize,
}

impl MessageStorage {
    pub(crate) fn new() -> MessageStorage {
        MessageStorage {
            channels: Mutex::new(Channels::default()),
            uncommitted_finalized: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one packet's payload to the youngest unfinalized message of
    /// `channel`, creating a fresh message (with a newly allocated local
    /// id) when none is under construction. `finalizing` marks the
    /// message complete.
    ///
    /// The bytes stay uncommitted until [`MessageStorage::commit`].
    pub(crate) fn append(&self, channel: u16, payload: &[u8], finalizing: bool) {
        let mut channels = self.lock();
        let rec = channels.map.entry(channel).or_insert_with(ChannelRec::new);

        let slot = match rec.messages.iter().rposition(|m| !m.finalized) {
            Some(i) => i,
            None => {
                let id = rec.next_message_id();
                rec.messages.push_back(MessageBuf::new(id));
                rec.messages.len() - 1
            }
        };
        let msg = &mut rec.messages[slot];
        msg.data.extend_from_slice(payload);
        msg.uncommitted_len += payload.len();
        if finalizing {
            msg.finalized = true;
            self.uncommitted_finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Seal every append of the current frame. Returns how many messages
    /// were finalized by the frame (and resets that count).
    pub(crate) fn commit(&self) -> usize {
        let mut channels = self.lock();
        for rec in channels.map.values_mut() {
            rec.commit();
        }
        self.uncommitted_finalized.swap(0, Ordering::SeqCst)
    }

    /// Revert every append of the current frame, byte for byte: lengths
    /// and contents of all messages return to their state before the
    /// frame started, and messages created within it disappear.
    pub(crate) fn rollback(&self) {
        let mut channels = self.lock();
        for rec in channels.map.values_mut() {
            rec.rollback();
        }
        channels.map.retain(|_, rec| !rec.has_no_data());
        self.uncommitted_finalized.store(0, Ordering::SeqCst);
    }

    /// Atomically transfer the oldest ready message of `channel` to the
    /// caller.
    pub(crate) fn pop_first_ready(&self, channel: u16) -> Option<ReceivedMessage> {
        let mut channels = self.lock();
        let rec = channels.map.get_mut(&channel)?;
        let idx = rec.messages.iter().position(MessageBuf::is_ready)?;
        let msg = rec.messages.remove(idx)?;
        Some(ReceivedMessage { channel, id: msg.id, data: msg.data })
    }

    /// Install (`Some`) or clear (`None`) the callback slot. `global`
    /// selects the fallback slot used by channels without their own
    /// callback; clearing a callback on a channel that was never seen is
    /// a no-op rather than a record allocation.
    pub(crate) fn set_callback(
        &self,
        channel: u16,
        global: bool,
        callback: Option<MessageReadyCallback>,
    ) {
        let mut channels = self.lock();
        if global {
            channels.global_callback = callback;
            return;
        }
        match callback {
            Some(cb) => {
                channels
                    .map
                    .entry(channel)
                    .or_insert_with(ChannelRec::new)
                    .callback = Some(cb);
            }
            None => {
                if let Some(rec) = channels.map.get_mut(&channel) {
                    rec.callback = None;
                    if rec.has_no_data() {
                        channels.map.remove(&channel);
                    }
                }
            }
        }
    }

    /// Observer for the callback slots.
    pub(crate) fn get_callback(&self, channel: u16, global: bool) -> Option<MessageReadyCallback> {
        let channels = self.lock();
        if global {
            return channels.global_callback.clone();
        }
        channels.map.get(&channel).and_then(|rec| rec.callback.clone())
    }

    /// Deliver every ready message of every channel to its callback
    /// (channel-specific if set, else the global fallback; none at all
    /// means the messages stay for [`MessageStorage::pop_first_ready`]).
    ///
    /// The storage lock is never held across a callback invocation, so
    /// callbacks may re-enter the engine. Returns the number of messages
    /// passed.
    pub(crate) fn pass_ready_to_consumer(&self) -> usize {
        let mut channel_ids: Vec<u16> = self.lock().map.keys().copied().collect();
        channel_ids.sort_unstable();

        let mut passed = 0;
        for channel in channel_ids {
            loop {
                let (callback, message) = {
                    let mut channels = self.lock();
                    let global = channels.global_callback.clone();
                    let Some(rec) = channels.map.get_mut(&channel) else { break };
                    let Some(callback) = rec.callback.clone().or(global) else { break };
                    let Some(idx) = rec.messages.iter().position(MessageBuf::is_ready) else {
                        break;
                    };
                    let Some(msg) = rec.messages.remove(idx) else { break };
                    (callback, ReceivedMessage { channel, id: msg.id, data: msg.data })
                };
                callback(message);
                passed += 1;
            }
        }
        passed
    }

    /// Drop every message and callback registration. Shutdown only.
    pub(crate) fn free(&self) {
        let mut channels = self.lock();
        channels.map.clear();
        channels.global_callback = None;
        self.uncommitted_finalized.store(0, Ordering::SeqCst);
    }
}
