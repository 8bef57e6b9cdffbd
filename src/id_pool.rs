//! Bounded message-ID allocator with salted, recyclable IDs.
//!
//! A monotonically increasing high-water mark, a free-list of returned IDs,
//! and a random salt added (mod `max_ids`) onto every emitted ID so wire IDs
//! don't look sequential to an observer.

use rand::Rng;
use spin::Mutex;

use crate::{error::Error, macros::safe_assert};

struct State {
    salt: u32,
    max_ids: u32,
    highest_used_id: Option<u32>,
    freed_ids: Vec<u32>,
}

/// Thread-safe pool of IDs in `[0, 2^id_bits)`.
///
/// `id_bits` out of `[0, 30]` is a programmer error (the facade validates
/// this before ever constructing a pool), so it asserts rather than
/// returning a typed error.
pub(crate) struct IdPool {
    state: Mutex<State>,
}

impl IdPool {
    pub(crate) fn new(id_bits: u32) -> Self {
        safe_assert!(id_bits <= 30, "id_bits ({id_bits}) out of allowed range 0-30");
        let max_ids = 1u32 << id_bits;
        let salt = rand::rng().random::<u32>();
        Self {
            state: Mutex::new(State { salt, max_ids, highest_used_id: None, freed_ids: Vec::new() }),
        }
    }

    /// Allocates the next free ID, salted for the wire. Returns
    /// [`Error::IdPoolExhausted`] once every slot in `[0, 2^id_bits)` is in
    /// use.
    pub(crate) fn allocate(&self) -> Result<u32, Error> {
        let mut state = self.state.lock();
        let raw = if let Some(id) = state.freed_ids.pop() {
            id
        } else {
            let next = state.highest_used_id.map_or(0, |h| h + 1);
            if next >= state.max_ids {
                return Err(Error::IdPoolExhausted);
            }
            state.highest_used_id = Some(next);
            next
        };
        let mask = state.max_ids - 1;
        Ok(raw.wrapping_add(state.salt) & mask)
    }

    /// Returns `id` (as emitted by [`Self::allocate`]) to the free-list.
    ///
    /// Not idempotent: deallocating an ID that was never allocated (or
    /// deallocating it twice) corrupts the free-list. Callers, exclusively
    /// [`crate::state_machine::RequestStateMachine`], must uphold this.
    pub(crate) fn deallocate(&self, id: u32) {
        let mut state = self.state.lock();
        let mask = state.max_ids - 1;
        let raw = id.wrapping_sub(state.salt) & mask;
        state.freed_ids.push(raw);
    }
}
