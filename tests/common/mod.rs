//! Shared harness for wiring two in-process `Protocol` peers back to back.
//!
//! Each side's `MessageSender` pushes emitted chunks onto an mpsc channel;
//! a background thread drains the channel and feeds the bytes into the
//! other side's `Protocol`, the same way a real transport thread would read
//! off a socket. No real I/O is involved — this exercises exactly the
//! negotiation/codec/state-machine/facade surface under test.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use streamux::{MessageReceiver, MessageSender, Protocol, Result};

/// Installs a `tracing` subscriber the first time it's called so failing
/// tests show negotiation/decoder warnings instead of swallowing them.
/// Respects `RUST_LOG`; safe to call from every test, every time.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct ChannelSender {
    out: Sender<Vec<u8>>,
    able_to_send: Arc<AtomicBool>,
}

impl MessageSender for ChannelSender {
    fn on_able_to_send(&self) {
        self.able_to_send.store(true, Ordering::SeqCst);
    }

    fn on_message_chunk_to_send(&self, _priority: i64, _message_id: i64, chunk: &[u8]) -> Result<()> {
        let _ = self.out.send(chunk.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RequestChunk { id: u32, is_end: bool, data: Vec<u8> },
    ResponseChunk { id: u32, is_end: bool, data: Vec<u8> },
    Ping { id: u32 },
    PingAck { id: u32 },
    Cancel { id: u32 },
    CancelAck { id: u32 },
    EmptyResponse { id: u32 },
}

pub struct RecordingReceiver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingReceiver {
    pub fn new() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (Self { events: Arc::clone(&events) }, events)
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl MessageReceiver for RecordingReceiver {
    fn on_request_chunk_received(&self, id: u32, is_end: bool, data: &[u8]) -> Result<()> {
        self.push(Event::RequestChunk { id, is_end, data: data.to_vec() });
        Ok(())
    }

    fn on_response_chunk_received(&self, id: u32, is_end: bool, data: &[u8]) -> Result<()> {
        self.push(Event::ResponseChunk { id, is_end, data: data.to_vec() });
        Ok(())
    }

    fn on_ping_received(&self, id: u32) -> Result<()> {
        self.push(Event::Ping { id });
        Ok(())
    }

    fn on_ping_ack_received(&self, id: u32, _latency: Duration) -> Result<()> {
        self.push(Event::PingAck { id });
        Ok(())
    }

    fn on_cancel_received(&self, id: u32) -> Result<()> {
        self.push(Event::Cancel { id });
        Ok(())
    }

    fn on_cancel_ack_received(&self, id: u32) -> Result<()> {
        self.push(Event::CancelAck { id });
        Ok(())
    }

    fn on_empty_response_received(&self, id: u32) -> Result<()> {
        self.push(Event::EmptyResponse { id });
        Ok(())
    }
}

pub type TestProtocol = Protocol<ChannelSender, RecordingReceiver>;

pub struct Peer {
    pub protocol: TestProtocol,
    pub events: Arc<Mutex<Vec<Event>>>,
    able_to_send: Arc<AtomicBool>,
}

impl Peer {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn can_send(&self) -> bool {
        self.able_to_send.load(Ordering::SeqCst)
    }
}

/// Default axis bounds wide enough for every scenario below, with no quick
/// init, so `Protocol::new` is a one-liner at each call site.
pub fn default_axes() -> (u32, u32, u32, u32, u32, u32) {
    (0, 29, 4, 1, 30, 10)
}

/// Builds a single negotiated `Protocol` with no live peer on the other
/// end — useful for tests that feed crafted bytes directly and don't want a
/// background pump thread racing their own `feed` calls.
///
/// Negotiates by looping the peer's own init frame back at itself: with a
/// symmetric config that's exactly equivalent to talking to an identical
/// peer, and avoids needing a second `Protocol` just to produce one init
/// message.
pub fn lone_peer(axes: Axes) -> (TestProtocol, Arc<Mutex<Vec<Event>>>) {
    init_tracing();
    let (tx, rx) = channel::<Vec<u8>>();
    let (recv, events) = RecordingReceiver::new();
    let able_to_send = Arc::new(AtomicBool::new(false));
    let protocol = Protocol::new(
        axes.id_min,
        axes.id_max,
        axes.id_rec,
        axes.length_min,
        axes.length_max,
        axes.length_rec,
        false,
        false,
        ChannelSender { out: tx, able_to_send },
        recv,
    )
    .expect("lone peer construction");

    protocol.send_initialization().unwrap();
    let own_init = rx.recv().expect("init frame was sent");
    protocol.feed(&own_init).unwrap();

    (protocol, events)
}

pub struct Harness {
    pub a: Peer,
    pub b: Peer,
    pump_a_to_b: JoinHandle<()>,
    pump_b_to_a: JoinHandle<()>,
}

/// One side's `(id_min, id_max, id_rec, length_min, length_max, length_rec)`.
#[derive(Debug, Clone, Copy)]
pub struct Axes {
    pub id_min: u32,
    pub id_max: u32,
    pub id_rec: u32,
    pub length_min: u32,
    pub length_max: u32,
    pub length_rec: u32,
}

impl From<(u32, u32, u32, u32, u32, u32)> for Axes {
    fn from((id_min, id_max, id_rec, length_min, length_max, length_rec): (u32, u32, u32, u32, u32, u32)) -> Self {
        Self { id_min, id_max, id_rec, length_min, length_max, length_rec }
    }
}

impl Harness {
    /// Builds two peers with identical `(id_bits, length_bits)` axis
    /// configuration, exchanges init frames, and spins up the pump threads
    /// that shuttle bytes between them.
    pub fn new(id_min: u32, id_max: u32, id_rec: u32, length_min: u32, length_max: u32, length_rec: u32) -> Self {
        let axes = Axes { id_min, id_max, id_rec, length_min, length_max, length_rec };
        Self::new_asymmetric(axes, axes)
    }

    /// Builds two peers whose axis configuration may differ, exercising the
    /// full negotiation range-intersection instead of the trivially
    /// symmetric case.
    pub fn new_asymmetric(a: Axes, b: Axes) -> Self {
        init_tracing();
        let (a_to_b_tx, a_to_b_rx) = channel::<Vec<u8>>();
        let (b_to_a_tx, b_to_a_rx) = channel::<Vec<u8>>();

        let (recv_a, events_a) = RecordingReceiver::new();
        let (recv_b, events_b) = RecordingReceiver::new();

        let able_to_send_a = Arc::new(AtomicBool::new(false));
        let able_to_send_b = Arc::new(AtomicBool::new(false));

        let protocol_a = Protocol::new(
            a.id_min,
            a.id_max,
            a.id_rec,
            a.length_min,
            a.length_max,
            a.length_rec,
            false,
            false,
            ChannelSender { out: a_to_b_tx, able_to_send: Arc::clone(&able_to_send_a) },
            recv_a,
        )
        .expect("peer a construction");

        let protocol_b = Protocol::new(
            b.id_min,
            b.id_max,
            b.id_rec,
            b.length_min,
            b.length_max,
            b.length_rec,
            false,
            false,
            ChannelSender { out: b_to_a_tx, able_to_send: Arc::clone(&able_to_send_b) },
            recv_b,
        )
        .expect("peer b construction");

        protocol_a.send_initialization().unwrap();
        protocol_b.send_initialization().unwrap();

        let pump_b_to_a = spawn_pump(a_to_b_rx, protocol_b.clone());
        let pump_a_to_b = spawn_pump(b_to_a_rx, protocol_a.clone());

        let harness = Self {
            a: Peer { protocol: protocol_a, events: events_a, able_to_send: able_to_send_a },
            b: Peer { protocol: protocol_b, events: events_b, able_to_send: able_to_send_b },
            pump_a_to_b,
            pump_b_to_a,
        };

        assert!(wait_until(|| harness.a.can_send() && harness.b.can_send(), Duration::from_secs(1)), "negotiation never completed");
        harness
    }
}

fn spawn_pump(rx: Receiver<Vec<u8>>, into: TestProtocol) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(frame) = rx.recv() {
            if into.feed(&frame).is_err() {
                break;
            }
        }
    })
}

pub fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return cond();
        }
        thread::sleep(Duration::from_millis(1));
    }
}
