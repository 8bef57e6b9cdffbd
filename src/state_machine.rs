//! Per-request state machine.
//!
//! Advances state as soon as a send is attempted (not only on the receive
//! path). States live in a map keyed by wire ID, guarded by a single
//! short-critical-section lock: every method here only observes
//! or mutates state while holding the lock and never calls back into user
//! code. [`crate::protocol::Protocol`] decides what to *do* with the
//! returned transition after the lock is released, so a user callback can
//! never re-enter this type while it's held.

use std::collections::HashMap;

use spin::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    Allocated,
    Sending,
    AwaitingResponse,
    ReceivingResponse,
    AwaitingCancelAck,
}

pub(crate) struct RequestStateMachine {
    states: Mutex<HashMap<u32, RequestState>>,
}

impl RequestStateMachine {
    pub(crate) fn new() -> Self {
        Self { states: Mutex::new(HashMap::new()) }
    }

    /// Registers a freshly allocated ID. Called right after
    /// [`crate::id_pool::IdPool::allocate`] succeeds.
    pub(crate) fn track_allocated(&self, id: u32) {
        self.states.lock().insert(id, RequestState::Allocated);
    }

    pub(crate) fn state_of(&self, id: u32) -> Option<RequestState> {
        self.states.lock().get(&id).copied()
    }

    /// An outgoing chunk, first or subsequent. `Allocated` only ever sees
    /// this once, for the first chunk of a new request; after that the id
    /// stays in `Sending` until `is_end` advances it to `AwaitingResponse`.
    /// At that point the request is fully sent and now only waits on the
    /// peer.
    pub(crate) fn try_send_request_chunk(&self, id: u32, is_end: bool) -> Result<(), Error> {
        let mut states = self.states.lock();
        match states.get(&id) {
            Some(RequestState::Allocated | RequestState::Sending) => {
                states.insert(id, if is_end { RequestState::AwaitingResponse } else { RequestState::Sending });
                Ok(())
            }
            other => Err(unexpected_state(id, other.copied(), "send request chunk")),
        }
    }

    /// `{Sending, AwaitingResponse, ReceivingResponse} -> AwaitingCancelAck`.
    /// Returns `Ok(true)` if this call caused the transition and a cancel
    /// frame should be sent. Returns `Ok(false)` (no frame, no callback) for
    /// every other state: `Allocated` (nothing has been sent yet, so there's
    /// nothing to cancel on the wire), a cancel already in flight, or an
    /// unknown/deallocated id (double-cancel, or a cancel racing the
    /// request's own completion).
    pub(crate) fn try_cancel_request(&self, id: u32) -> Result<bool, Error> {
        let mut states = self.states.lock();
        match states.get(&id) {
            Some(RequestState::Sending | RequestState::AwaitingResponse | RequestState::ReceivingResponse) => {
                states.insert(id, RequestState::AwaitingCancelAck);
                Ok(true)
            }
            Some(RequestState::Allocated | RequestState::AwaitingCancelAck) | None => Ok(false),
        }
    }

    /// A response chunk arrived. Valid from `AwaitingResponse` (the first
    /// one) or `ReceivingResponse` (subsequent ones); returns `Ok(true)` and
    /// transitions, forgetting the id on `is_end`. A chunk racing an
    /// in-flight cancel (`AwaitingCancelAck`) is silently ignored:
    /// `Ok(false)`, no callback, no deallocation. Any other state is a
    /// genuine protocol violation (response before the request even
    /// finished sending, or for an id nobody allocated).
    pub(crate) fn try_receive_response_chunk(&self, id: u32, is_end: bool) -> Result<bool, Error> {
        let mut states = self.states.lock();
        match states.get(&id) {
            Some(RequestState::AwaitingResponse | RequestState::ReceivingResponse) => {
                if is_end {
                    states.remove(&id);
                } else {
                    states.insert(id, RequestState::ReceivingResponse);
                }
                Ok(true)
            }
            Some(RequestState::AwaitingCancelAck) => Ok(false),
            other => Err(unexpected_state(id, other.copied(), "receive response chunk")),
        }
    }

    /// The peer acknowledged our cancel. Only `AwaitingCancelAck` actually
    /// deallocates and reports `Ok(true)`; every other state (already
    /// deallocated, never canceled) is ignored: `Ok(false)`, no callback.
    pub(crate) fn try_receive_cancel_ack(&self, id: u32) -> bool {
        let mut states = self.states.lock();
        match states.get(&id) {
            Some(RequestState::AwaitingCancelAck) => {
                states.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Forcibly forgets `id` regardless of its current state. Used when a
    /// session is torn down with requests still outstanding.
    pub(crate) fn forget(&self, id: u32) {
        self.states.lock().remove(&id);
    }
}

fn unexpected_state(id: u32, state: Option<RequestState>, action: &str) -> Error {
    match state {
        Some(state) => Error::ProtocolViolation(format!("request {id}: cannot {action} from state {state:?}")),
        None => Error::MessageAlreadyEnded(id),
    }
}
