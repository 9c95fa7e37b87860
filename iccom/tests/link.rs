//! End-to-end exercises: two engines joined by an in-memory lockstep
//! link, plus single-engine drives with handcrafted peer frames.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iccom::wire::package::{Package, PAYLOAD_OFFSET};
use iccom::wire::{ACK_BYTE, NACK_BYTE};
use iccom::{
    Config, Continuation, Engine, Error, FullDuplex, ReceivedMessage, XchangeStatus, Xfer,
    XferHandler, ANY_CHANNEL,
};

// ─── In-memory test link ──────────────────────────────────────────────────────

#[derive(Default)]
struct LinkState {
    handler: Option<Arc<dyn XferHandler>>,
    pending: Option<Xfer>,
    running: bool,
    halted: bool,
}

/// A `FullDuplex` whose exchanges are clocked explicitly by the test.
/// Cloning shares the underlying device state, so tests keep a handle
/// to a link after moving it into an engine.
#[derive(Clone, Default)]
struct TestLink {
    state: Arc<Mutex<LinkState>>,
}

impl TestLink {
    fn new() -> TestLink {
        TestLink::default()
    }

    fn current_tx(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .pending
            .as_ref()
            .expect("no pending xfer")
            .tx
            .clone()
    }

    fn apply(&self, continuation: Continuation) {
        let mut st = self.state.lock().unwrap();
        match continuation {
            Continuation::Next { xfer, .. } => st.pending = Some(xfer),
            Continuation::Halt => {
                st.halted = true;
                st.running = false;
            }
        }
    }

    /// Complete the pending exchange, feeding `rx` as the peer's bytes.
    fn complete(&self, rx: &[u8]) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handler
            .clone()
            .expect("link not started");
        self.apply(handler.xfer_done(rx));
    }

    /// Fail the pending exchange on the transport layer.
    fn fail(&self, error: &str) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handler
            .clone()
            .expect("link not started");
        self.apply(handler.xfer_failed(&error));
    }

    fn halted(&self) -> bool {
        self.state.lock().unwrap().halted
    }
}

impl FullDuplex for TestLink {
    type Error = std::io::Error;

    fn start(&mut self, handler: Arc<dyn XferHandler>, initial: Xfer) -> Result<(), Self::Error> {
        let mut st = self.state.lock().unwrap();
        st.handler = Some(handler);
        st.pending = Some(initial);
        st.running = true;
        Ok(())
    }

    fn data_xchange(&self, replacement: Option<Xfer>, _start_immediately: bool) -> XchangeStatus {
        let mut st = self.state.lock().unwrap();
        if !st.running {
            return XchangeStatus::NoDevice;
        }
        if let Some(xfer) = replacement {
            st.pending = Some(xfer);
        }
        // The harness clocks exchanges explicitly.
        XchangeStatus::NotReady
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn reset(&mut self, initial: Xfer) -> Result<(), Self::Error> {
        self.state.lock().unwrap().pending = Some(initial);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().running = false;
    }
}

// ─── Lockstep pair harness ────────────────────────────────────────────────────

struct Pair {
    a: Engine<TestLink>,
    b: Engine<TestLink>,
    link_a: TestLink,
    link_b: TestLink,
}

impl Pair {
    fn start() -> Pair {
        let link_a = TestLink::new();
        let link_b = TestLink::new();
        let a = Engine::start(link_a.clone(), Config::default()).unwrap();
        let b = Engine::start(link_b.clone(), Config::default()).unwrap();
        Pair { a, b, link_a, link_b }
    }

    /// One coupled exchange: both sides clock their pending frames
    /// against each other.
    fn exchange(&self) {
        let frame_a = self.link_a.current_tx();
        let frame_b = self.link_b.current_tx();
        assert_eq!(frame_a.len(), frame_b.len(), "phase desync between peers");
        self.link_a.complete(&frame_b);
        self.link_b.complete(&frame_a);
    }

    /// Run `n` full frame cycles (one data and one ack exchange each).
    fn run_cycles(&self, n: usize) {
        for _ in 0..n {
            self.exchange();
            self.exchange();
        }
    }
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn single_short_message() {
    let pair = Pair::start();
    pair.a.post_message(0x1234, b"Hello", 0).unwrap();
    pair.run_cycles(2);

    let msg = pair.b.read_message(0x1234).unwrap().expect("message not delivered");
    assert_eq!(msg.channel, 0x1234);
    assert_eq!(msg.id, 1);
    assert_eq!(msg.data, b"Hello");
    assert!(pair.b.read_message(0x1234).unwrap().is_none());

    let stats = pair.b.statistics();
    assert_eq!(stats.messages_received_ok, 1);
    assert_eq!(stats.packets_received_ok, 1);
    assert_eq!(stats.total_consumer_bytes_received_ok, 5);
}

#[test]
fn fragmentation_across_two_frames() {
    let data: Vec<u8> = (0u8..100).collect();
    let pair = Pair::start();
    pair.a.post_message(0x0001, &data, 0).unwrap();

    // Cycle 1 carries the in-flight empty head, cycle 2 the first
    // fragment (complete = 0): nothing must be ready yet.
    pair.run_cycles(2);
    assert!(pair.b.read_message(0x0001).unwrap().is_none());

    // Cycle 3 carries the finalizing fragment.
    pair.run_cycles(1);
    let msg = pair.b.read_message(0x0001).unwrap().expect("message not reassembled");
    assert_eq!(msg.data, data);
    assert!(pair.b.read_message(0x0001).unwrap().is_none());
}

#[test]
fn multi_channel_interleave_in_one_frame() {
    let pair = Pair::start();
    pair.a.post_message(1, b"A", 0).unwrap();
    pair.a.post_message(2, b"BB", 0).unwrap();
    pair.run_cycles(2);

    let first = pair.b.read_message(1).unwrap().expect("channel 1 message");
    let second = pair.b.read_message(2).unwrap().expect("channel 2 message");
    assert_eq!(first.data, b"A");
    assert_eq!(second.data, b"BB");

    // Both arrived in the same data frame.
    let stats = pair.b.statistics();
    assert_eq!(stats.packets_received_ok, 2);
    assert_eq!(stats.messages_received_ok, 2);
}

#[test]
fn corrupted_frame_is_nacked_and_resent() {
    let pair = Pair::start();
    pair.a.post_message(0x10, b"payload", 0).unwrap();
    // Deliver the in-flight empty head; the message frame moves up.
    pair.run_cycles(1);

    let frame_a = pair.link_a.current_tx();
    let frame_b = pair.link_b.current_tx();
    let mut corrupted = frame_a.clone();
    corrupted[PAYLOAD_OFFSET + 4] ^= 0x40;

    pair.link_b.complete(&corrupted);
    pair.link_a.complete(&frame_b);
    assert_eq!(pair.link_b.current_tx(), vec![NACK_BYTE]);
    assert_eq!(pair.link_a.current_tx(), vec![ACK_BYTE]);

    // Ack exchange: A sees the nack and prepares the same frame again.
    pair.exchange();
    assert_eq!(pair.link_a.current_tx(), frame_a, "resend must be unchanged");

    // Clean retransmission now goes through.
    pair.run_cycles(1);
    let msg = pair.b.read_message(0x10).unwrap().expect("message after resend");
    assert_eq!(msg.data, b"payload");
    assert!(pair.b.read_message(0x10).unwrap().is_none());

    let stats = pair.b.statistics();
    assert_eq!(stats.packages_bad_data_received, 1);
    assert_eq!(stats.messages_received_ok, 1);
}

#[test]
fn duplicated_package_is_acked_but_dropped() {
    let link = TestLink::new();
    let engine = Engine::start(link.clone(), Config::default()).unwrap();

    let mut peer_frame = Package::new_empty(64, 5);
    peer_frame.add_packet(b"x", 9);
    peer_frame.finalize();

    // First receipt: accepted and acked.
    link.complete(peer_frame.as_bytes());
    assert_eq!(link.current_tx(), vec![ACK_BYTE]);
    link.complete(&[ACK_BYTE]);

    // The peer missed our ack and sends the same package id again:
    // acked so the peer advances, but no bytes are delivered.
    link.complete(peer_frame.as_bytes());
    assert_eq!(link.current_tx(), vec![ACK_BYTE]);
    link.complete(&[ACK_BYTE]);

    let msg = engine.read_message(9).unwrap().expect("first receipt delivers");
    assert_eq!(msg.data, b"x");
    assert!(engine.read_message(9).unwrap().is_none());

    let stats = engine.statistics();
    assert_eq!(stats.packages_duplicated_received, 1);
    assert_eq!(stats.messages_received_ok, 1);
}

#[test]
fn flush_transmits_well_formed_empty_frame() {
    let link = TestLink::new();
    let engine = Engine::start(link.clone(), Config::default()).unwrap();
    engine.flush().unwrap();

    let frame = link.current_tx();
    assert_eq!(frame.len(), 64);
    let package = Package::from_bytes(frame);
    assert_eq!(package.verify().unwrap(), 0);
    assert_eq!(package.id(), 1);
}

#[test]
fn transport_failure_resyncs_with_nack_then_resend() {
    let link = TestLink::new();
    let engine = Engine::start(link.clone(), Config::default()).unwrap();
    engine.post_message(1, b"hi", 0).unwrap();

    // Deliver the empty head so the message frame is in flight.
    let mut peer_frame = Package::new_empty(64, 7);
    peer_frame.finalize();
    link.complete(peer_frame.as_bytes());
    link.complete(&[ACK_BYTE]);
    let in_flight = link.current_tx();
    assert_ne!(in_flight, vec![ACK_BYTE]);

    // The exchange dies on the bus: the engine answers with a nack
    // frame to complete the cycle...
    link.fail("spi timeout");
    assert_eq!(link.current_tx(), vec![NACK_BYTE]);

    // ...and the next data phase retransmits the same head.
    link.complete(&[NACK_BYTE]);
    assert_eq!(link.current_tx(), in_flight);
}

#[test]
fn close_halts_transport_and_fails_api() {
    let pair = Pair::start();
    pair.a.close();

    assert!(!pair.a.is_running());
    assert!(matches!(pair.a.post_message(1, b"x", 0), Err(Error::Closing)));
    assert!(matches!(pair.a.flush(), Err(Error::Closing)));
    assert!(matches!(pair.a.read_message(1), Err(Error::Closing)));

    // The next return point tells the transport to halt.
    pair.link_a.complete(&[ACK_BYTE]);
    assert!(pair.link_a.halted());

    // Closing again is a no-op.
    pair.a.close();
}

#[test]
fn api_validates_channels_and_data() {
    let pair = Pair::start();
    assert!(matches!(
        pair.a.post_message(0x9999, b"x", 0),
        Err(Error::InvalidChannel(0x9999))
    ));
    assert!(matches!(
        pair.a.post_message(ANY_CHANNEL, b"x", 0),
        Err(Error::InvalidChannel(_))
    ));
    assert!(matches!(pair.a.post_message(1, b"", 0), Err(Error::EmptyMessage)));
    assert!(matches!(
        pair.a.read_message(0xFFFF),
        Err(Error::InvalidChannel(0xFFFF))
    ));
}

#[test]
fn engine_start_rejects_tiny_frames() {
    assert!(matches!(
        Engine::start(TestLink::new(), Config { frame_size: 8 }),
        Err(Error::InvalidFrameSize(8))
    ));
}

#[test]
fn callback_slots_per_channel_and_global() {
    let pair = Pair::start();
    let cb: iccom::MessageReadyCallback = Arc::new(|_msg| {});

    pair.b.set_channel_callback(3, Arc::clone(&cb)).unwrap();
    assert!(pair.b.get_channel_callback(3).unwrap().is_some());
    assert!(pair.b.get_channel_callback(4).unwrap().is_none());

    pair.b.set_channel_callback(ANY_CHANNEL, cb).unwrap();
    assert!(pair.b.get_channel_callback(ANY_CHANNEL).unwrap().is_some());

    pair.b.remove_channel_callback(3).unwrap();
    assert!(pair.b.get_channel_callback(3).unwrap().is_none());

    assert!(matches!(
        pair.b.set_channel_callback(0x8001, Arc::new(|_| {})),
        Err(Error::InvalidChannel(_))
    ));
}

#[test]
fn callbacks_deliver_in_channel_insertion_order() {
    let pair = Pair::start();
    let (tx, rx) = mpsc::channel::<ReceivedMessage>();
    pair.b
        .set_channel_callback(
            ANY_CHANNEL,
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
        )
        .unwrap();

    pair.a.post_message(1, b"A", 0).unwrap();
    pair.a.post_message(2, b"BB", 0).unwrap();
    pair.run_cycles(2);

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first.channel, first.data), (1, b"A".to_vec()));
    assert_eq!((second.channel, second.data), (2, b"BB".to_vec()));
}

#[test]
fn callback_may_post_a_reply() {
    let link_a = TestLink::new();
    let link_b = TestLink::new();
    let a = Engine::start(link_a.clone(), Config::default()).unwrap();
    let b = Arc::new(Engine::start(link_b.clone(), Config::default()).unwrap());

    let replier = Arc::clone(&b);
    b.set_channel_callback(
        1,
        Arc::new(move |msg| {
            replier.post_message(2, &msg.data, 0).unwrap();
        }),
    )
    .unwrap();

    a.post_message(1, b"echo", 0).unwrap();

    let mut reply = None;
    for _ in 0..50 {
        let frame_a = link_a.current_tx();
        let frame_b = link_b.current_tx();
        assert_eq!(frame_a.len(), frame_b.len());
        link_a.complete(&frame_b);
        link_b.complete(&frame_a);
        if let Some(msg) = a.read_message(2).unwrap() {
            reply = Some(msg);
            break;
        }
        // Give the delivery thread a moment to invoke the callback.
        std::thread::sleep(Duration::from_millis(5));
    }

    let reply = reply.expect("no echo reply arrived");
    assert_eq!(reply.data, b"echo");
    // Break the callback → engine reference cycle before teardown.
    b.close();
}

#[test]
fn tx_queue_never_runs_dry() {
    let pair = Pair::start();
    assert!(pair.a.statistics().packages_in_tx_queue >= 1);

    pair.a.post_message(5, &[0xAA; 300], 0).unwrap();
    assert!(pair.a.statistics().packages_in_tx_queue >= 1);

    pair.run_cycles(12);
    // Everything delivered and acked; the queue is back to its single
    // recycled empty package.
    assert_eq!(pair.a.statistics().packages_in_tx_queue, 1);
    assert_eq!(pair.b.read_message(5).unwrap().unwrap().data, vec![0xAA; 300]);
}

#[test]
fn per_channel_delivery_order_follows_completion() {
    let pair = Pair::start();
    pair.a.post_message(6, b"first", 0).unwrap();
    pair.a.post_message(6, b"second", 0).unwrap();
    pair.run_cycles(4);

    assert_eq!(pair.b.read_message(6).unwrap().unwrap().data, b"first");
    assert_eq!(pair.b.read_message(6).unwrap().unwrap().data, b"second");
}

#[test]
fn statistics_report_renders_counters() {
    let pair = Pair::start();
    pair.a.post_message(1, b"stat", 0).unwrap();
    pair.run_cycles(2);

    let report = pair.a.statistics_report();
    assert!(report.contains("transport_layer: xfers done:"));
    assert!(report.contains("packages: sent ok:"));
    assert!(report.contains("bandwidth: consumer bytes received:"));
    assert_eq!(report.lines().count(), 15);

    let stats = pair.a.statistics();
    assert!(stats.transport_xfers_done >= 4);
    assert!(stats.packages_sent_ok >= 1);
}
