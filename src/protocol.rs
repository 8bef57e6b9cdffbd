//! The public facade: negotiation, frame dispatch, and the request/response/
//! ping/cancel surface the embedder actually calls.
//!
//! A session-fatal error (negotiation failure or a malformed header) latches.
//! Once `feed` returns one of those, every later call on this `Protocol`
//! keeps returning it rather than touching state again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::decoder::FrameDecoder;
use crate::error::{Error, Result};
use crate::header::{HeaderCodec, MessageType};
use crate::id_pool::IdPool;
use crate::negotiator::{self, AxisConfig, Negotiator};
use crate::sendable::{SendableMessage, PRIORITY_OOB};
use crate::state_machine::RequestStateMachine;

/// Invoked by the core to push bytes out. `message_id` is `-1` for the
/// per-session init frame, which has no associated request.
pub trait MessageSender: Send + Sync {
    /// The session can now originate `send_request`/`send_response` calls.
    fn on_able_to_send(&self);
    /// Emit `chunk` on the transport, in `priority` order (higher first).
    fn on_message_chunk_to_send(&self, priority: i64, message_id: i64, chunk: &[u8]) -> Result<()>;
}

/// Invoked by the core as frames are decoded off an incoming stream.
pub trait MessageReceiver: Send + Sync {
    fn on_request_chunk_received(&self, id: u32, is_end: bool, data: &[u8]) -> Result<()>;
    fn on_response_chunk_received(&self, id: u32, is_end: bool, data: &[u8]) -> Result<()>;
    fn on_ping_received(&self, id: u32) -> Result<()>;
    fn on_ping_ack_received(&self, id: u32, latency: Duration) -> Result<()>;
    fn on_cancel_received(&self, id: u32) -> Result<()>;
    fn on_cancel_ack_received(&self, id: u32) -> Result<()>;
    fn on_empty_response_received(&self, id: u32) -> Result<()>;
}

/// Built once negotiation commits to a concrete `(id_bits, length_bits)`,
/// either eagerly by a quick-init requester, or lazily the moment the peer's
/// init frame is decoded.
struct Core {
    codec: Arc<HeaderCodec>,
    decoder: Mutex<FrameDecoder>,
    id_pool: IdPool,
    state_machine: RequestStateMachine,
    ping_tracker: Mutex<HashMap<u32, Instant>>,
    active_incoming: Mutex<HashSet<u32>>,
}

impl Core {
    fn new(id_bits: u32, length_bits: u32) -> Self {
        Self {
            codec: Arc::new(HeaderCodec::new(id_bits, length_bits)),
            decoder: Mutex::new(FrameDecoder::new(id_bits, length_bits)),
            id_pool: IdPool::new(id_bits),
            state_machine: RequestStateMachine::new(),
            ping_tracker: Mutex::new(HashMap::new()),
            active_incoming: Mutex::new(HashSet::new()),
        }
    }
}

struct Inner<S, R> {
    sender: S,
    receiver: R,
    negotiator: Mutex<Negotiator>,
    core: Mutex<Option<Core>>,
    /// Set once a `MalformedHeader` is observed. `feed` latches onto this
    /// forever after, same as a negotiation failure.
    malformed: Mutex<Option<u32>>,
}

/// One multiplexed session over a single ordered byte stream. Cheap to
/// clone: clones share the same underlying state via `Arc`.
pub struct Protocol<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for Protocol<S, R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: MessageSender, R: MessageReceiver> Protocol<S, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id_min: u32,
        id_max: u32,
        id_recommended: u32,
        length_min: u32,
        length_max: u32,
        length_recommended: u32,
        request_quick_init: bool,
        allow_quick_init: bool,
        sender: S,
        receiver: R,
    ) -> Result<Self> {
        let config = negotiator::Config {
            id: AxisConfig { min: id_min, max: id_max, recommended: id_recommended },
            length: AxisConfig { min: length_min, max: length_max, recommended: length_recommended },
            request_quick_init,
            allow_quick_init,
        };
        let negotiator = Negotiator::new(config)?;

        let core = if negotiator.can_send() {
            Some(Core::new(negotiator.id_bits(), negotiator.length_bits()))
        } else {
            None
        };
        if core.is_some() {
            sender.on_able_to_send();
        }

        Ok(Self {
            inner: Arc::new(Inner {
                sender,
                receiver,
                negotiator: Mutex::new(negotiator),
                core: Mutex::new(core),
                malformed: Mutex::new(None),
            }),
        })
    }

    /// Emits this side's 5-byte init frame. Call exactly once, before
    /// feeding any bytes from the peer.
    pub fn send_initialization(&self) -> Result<()> {
        let frame = self.inner.negotiator.lock().build_initialize_message();
        self.inner.sender.on_message_chunk_to_send(PRIORITY_OOB, -1, &frame)
    }

    /// Drives negotiation (if not yet complete) and then frame decoding.
    /// Consumes all of `stream` or returns an error; a session-fatal error
    /// here latches and is returned again by every later call.
    pub fn feed(&self, mut stream: &[u8]) -> Result<()> {
        if let Some(err) = self.latched_failure() {
            return Err(err);
        }

        if !self.inner.negotiator.lock().is_complete() {
            let rest = {
                let mut negotiator = self.inner.negotiator.lock();
                negotiator.feed(stream)?
            };
            stream = rest;

            let became_ready = {
                let negotiator = self.inner.negotiator.lock();
                negotiator.is_complete() && negotiator.can_receive()
            };
            if became_ready {
                let mut core_slot = self.inner.core.lock();
                if core_slot.is_none() {
                    let negotiator = self.inner.negotiator.lock();
                    *core_slot = Some(Core::new(negotiator.id_bits(), negotiator.length_bits()));
                    drop(negotiator);
                    drop(core_slot);
                    self.inner.sender.on_able_to_send();
                }
            }
        }

        while !stream.is_empty() {
            let Some(frame_opt) = self.decode_one(stream)? else { break };
            let (rest, dispatched) = frame_opt;
            stream = rest;
            if !dispatched {
                break;
            }
        }
        Ok(())
    }

    /// Feeds `stream` through the frame decoder and dispatches at most one
    /// decoded frame. Returns `None` if there's no `Core` yet (the peer is
    /// sending data before negotiation finished on our end, a protocol
    /// violation we simply can't interpret yet). The inner `bool` says
    /// whether a frame was actually dispatched (vs. just buffered).
    fn decode_one<'a>(&self, stream: &'a [u8]) -> Result<Option<(&'a [u8], bool)>> {
        let core_guard = self.inner.core.lock();
        let Some(core) = core_guard.as_ref() else {
            return Err(Error::ProtocolViolation("received payload bytes before negotiation completed".to_string()));
        };

        let decoded = core.decoder.lock().feed(stream);
        let (rest, frame) = match decoded {
            Ok(ok) => ok,
            Err(Error::MalformedHeader(bits)) => {
                *self.inner.malformed.lock() = Some(bits);
                return Err(Error::MalformedHeader(bits));
            }
            Err(other) => return Err(other),
        };
        let Some(frame) = frame else {
            return Ok(Some((rest, false)));
        };
        let header = frame.header;
        let data = frame.data;
        drop(core_guard);

        self.dispatch(header.id, header.length, header.is_end, header.is_response, header.message_type, data)?;
        Ok(Some((rest, true)))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(&self, id: u32, length: u32, is_end: bool, is_response: bool, message_type: MessageType, data: &[u8]) -> Result<()> {
        let _ = (length, is_response);
        let core_guard = self.inner.core.lock();
        let core = core_guard.as_ref().expect("core exists for the duration of a dispatch");

        match message_type {
            MessageType::Request => {
                if is_end {
                    core.active_incoming.lock().remove(&id);
                } else {
                    core.active_incoming.lock().insert(id);
                }
                drop(core_guard);
                self.inner.receiver.on_request_chunk_received(id, is_end, data)
            }
            MessageType::Response => {
                let delivered = core.state_machine.try_receive_response_chunk(id, is_end)?;
                if delivered && is_end {
                    core.id_pool.deallocate(id);
                }
                drop(core_guard);
                if delivered {
                    self.inner.receiver.on_response_chunk_received(id, is_end, data)
                } else {
                    Ok(())
                }
            }
            MessageType::Cancel => {
                drop(core_guard);
                self.inner.receiver.on_cancel_received(id)?;
                self.send_control_frame(id, MessageType::CancelAck)
            }
            MessageType::CancelAck => {
                let acked = core.state_machine.try_receive_cancel_ack(id);
                if acked {
                    core.id_pool.deallocate(id);
                }
                drop(core_guard);
                if acked {
                    self.inner.receiver.on_cancel_ack_received(id)
                } else {
                    Ok(())
                }
            }
            MessageType::RequestEmptyTermination => {
                let was_active = core.active_incoming.lock().remove(&id);
                drop(core_guard);
                if was_active {
                    self.inner.receiver.on_request_chunk_received(id, true, &[])
                } else {
                    self.inner.receiver.on_ping_received(id)?;
                    self.send_control_frame(id, MessageType::EmptyResponse)
                }
            }
            MessageType::EmptyResponse => {
                let started_at = core.ping_tracker.lock().remove(&id);
                match started_at {
                    // The id was already released back to the pool the moment
                    // the ping was sent (see `ping`); only the timestamp is
                    // still owed to us here.
                    Some(started_at) => {
                        let latency = started_at.elapsed();
                        drop(core_guard);
                        self.inner.receiver.on_ping_ack_received(id, latency)
                    }
                    None => {
                        let delivered = core.state_machine.try_receive_response_chunk(id, true)?;
                        if delivered {
                            core.id_pool.deallocate(id);
                        }
                        drop(core_guard);
                        if delivered {
                            self.inner.receiver.on_empty_response_received(id)
                        } else {
                            Ok(())
                        }
                    }
                }
            }
        }
    }

    fn send_control_frame(&self, id: u32, message_type: MessageType) -> Result<()> {
        let frame = {
            let core_guard = self.inner.core.lock();
            let core = core_guard.as_ref().expect("core exists once negotiated");
            core.codec.encode_zero(id, message_type)
        };
        self.inner.sender.on_message_chunk_to_send(PRIORITY_OOB, i64::from(id), &frame)
    }

    fn latched_failure(&self) -> Option<Error> {
        if let Some(bits) = *self.inner.malformed.lock() {
            return Some(Error::MalformedHeader(bits));
        }
        let negotiator = self.inner.negotiator.lock();
        if negotiator.is_complete() && !negotiator.can_receive() && !negotiator.can_send() {
            Some(Error::NegotiationFailed(negotiator.explain_failure()))
        } else {
            None
        }
    }

    fn with_core<T>(&self, f: impl FnOnce(&Core) -> Result<T>) -> Result<T> {
        let core_guard = self.inner.core.lock();
        match core_guard.as_ref() {
            Some(core) => f(core),
            None => Err(Error::ProtocolViolation("session cannot send yet (negotiation not complete)".to_string())),
        }
    }

    fn codec(&self) -> Result<Arc<HeaderCodec>> {
        self.with_core(|core| Ok(Arc::clone(&core.codec)))
    }

    /// Sends a complete request in one call. Returns the allocated ID.
    pub fn send_request(&self, priority: i64, payload: &[u8]) -> Result<u32> {
        let mut stream = self.begin_request(priority)?;
        stream.feed(payload)?;
        stream.end()?;
        Ok(stream.id())
    }

    /// Sends a complete response in one call.
    pub fn send_response(&self, priority: i64, id: u32, payload: &[u8]) -> Result<()> {
        let mut stream = self.begin_response(priority, id)?;
        stream.feed(payload)?;
        stream.end()
    }

    /// Begins a streamed outgoing request. Callers drive it with
    /// [`OutgoingStream::feed`]/[`OutgoingStream::flush`]/[`OutgoingStream::end`].
    ///
    /// The allocated id stays in `Allocated` until the first chunk is
    /// actually sent, so a `cancel` issued before any payload goes out finds
    /// nothing to cancel on the wire (see [`crate::state_machine::RequestStateMachine::try_cancel_request`]).
    pub fn begin_request(&self, priority: i64) -> Result<OutgoingStream<S, R>> {
        let codec = self.codec()?;
        let id = self.with_core(|core| core.id_pool.allocate())?;
        self.with_core(|core| {
            core.state_machine.track_allocated(id);
            Ok(())
        })?;
        Ok(OutgoingStream {
            protocol: self.clone(),
            message: SendableMessage::new(id, false, codec),
            priority,
            kind: StreamKind::Request,
        })
    }

    /// Begins a streamed outgoing response to `id` (a previously received
    /// request).
    pub fn begin_response(&self, priority: i64, id: u32) -> Result<OutgoingStream<S, R>> {
        let codec = self.codec()?;
        Ok(OutgoingStream { protocol: self.clone(), message: SendableMessage::new(id, true, codec), priority, kind: StreamKind::Response })
    }

    /// Cancels an in-flight outgoing request. A no-op if cancellation is
    /// already pending, or if nothing has been sent for `id` yet.
    pub fn cancel(&self, id: u32) -> Result<()> {
        let should_send = self.with_core(|core| core.state_machine.try_cancel_request(id))?;
        if should_send {
            self.send_control_frame(id, MessageType::Cancel)?;
        }
        Ok(())
    }

    /// Sends a ping. Returns the ID to correlate with the eventual
    /// `on_ping_ack_received`. The id is released back to the pool as soon
    /// as the ping frame is sent; only its timestamp lives on in the
    /// ping-tracker until the ack (or forever, if it never arrives).
    pub fn ping(&self) -> Result<u32> {
        let id = self.with_core(|core| core.id_pool.allocate())?;
        self.with_core(|core| {
            core.ping_tracker.lock().insert(id, Instant::now());
            Ok(())
        })?;
        self.send_control_frame(id, MessageType::RequestEmptyTermination)?;
        self.with_core(|core| {
            core.id_pool.deallocate(id);
            Ok(())
        })?;
        Ok(id)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Request,
    Response,
}

/// A request or response in the middle of being sent. Wraps
/// [`SendableMessage`] with the state-machine bookkeeping and the actual
/// transport callback: `feed`/`flush`/`end` do both the buffering and the
/// send in one call.
pub struct OutgoingStream<S, R> {
    protocol: Protocol<S, R>,
    message: SendableMessage,
    priority: i64,
    kind: StreamKind,
}

impl<S: MessageSender, R: MessageReceiver> OutgoingStream<S, R> {
    pub fn id(&self) -> u32 {
        self.message.id()
    }

    pub fn max_chunk_len(&self) -> usize {
        self.message.max_chunk_len()
    }

    pub fn is_full(&self) -> bool {
        self.message.is_full()
    }

    /// Buffers `data`. While it overflows the current chunk, flushes full
    /// chunks as it goes; returns whatever didn't fit in the final partial
    /// chunk (buffered for the next call).
    pub fn feed<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8]> {
        let mut rest = data;
        loop {
            rest = self.message.feed(rest)?;
            if self.message.is_full() {
                self.flush()?;
            } else {
                return Ok(rest);
            }
        }
    }

    /// Sends whatever is currently buffered as a non-terminating chunk.
    /// No-op if nothing is buffered.
    pub fn flush(&mut self) -> Result<()> {
        if !self.message.has_buffered_payload() {
            return Ok(());
        }
        let frame = self.message.flush(false)?;
        self.send_frame(frame, false)
    }

    /// Emits the terminating chunk. Idempotent.
    pub fn end(&mut self) -> Result<()> {
        let already_ended = self.message.is_ended();
        let frame = self.message.end()?;
        if already_ended {
            return Ok(());
        }
        self.send_frame(frame, true)
    }

    fn send_frame(&self, frame: Vec<u8>, is_end: bool) -> Result<()> {
        let id = self.message.id();
        if self.kind == StreamKind::Request {
            self.protocol.with_core(|core| core.state_machine.try_send_request_chunk(id, is_end))?;
        }
        self.protocol.inner.sender.on_message_chunk_to_send(self.priority, i64::from(id), &frame)
    }
}
