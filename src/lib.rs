//! `streamux`: a byte-oriented, bidirectional, symmetric request/response
//! multiplexing protocol over a single ordered transport.
//!
//! The core assumes nothing about the transport beyond in-order, reliable
//! delivery of bytes: sockets, pipes, whatever the embedder already has.
//! Capability negotiation picks a wire geometry (`id_bits`, `length_bits`)
//! once per session (see [`Protocol::new`]); after that, every frame is a
//! packed header plus payload, and requests/responses/cancels/pings all
//! multiplex freely over the same stream.
//!
//! See `DESIGN.md` for how each module's design was grounded.

mod buffer;
mod decoder;
mod error;
mod header;
mod id_pool;
mod macros;
mod negotiator;
mod protocol;
mod sendable;
mod state_machine;

pub use error::{Error, Result};
pub use protocol::{MessageReceiver, MessageSender, OutgoingStream, Protocol};
