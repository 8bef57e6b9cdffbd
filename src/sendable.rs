//! Buffers one request or response stream's outgoing chunks and packs each
//! into a ready-to-write frame.
//!
//! Reuses [`crate::buffer::FeedableBuffer`]'s `min` floor to reserve header
//! space in the same allocation as the payload, so a flush is always one
//! contiguous `Vec<u8>`, never a header write followed by a payload write.
//! Cancel and cancel-ack frames are always zero-length control frames built
//! directly with [`crate::header::HeaderCodec::encode_zero`]; this type only
//! ever speaks for `Request`/`Response` streams, so there's no way to misuse
//! it for those message types.

use std::sync::Arc;

use crate::buffer::FeedableBuffer;
use crate::error::Error;
use crate::header::HeaderCodec;

/// Send priority for frames that must jump ahead of ordinary request/response
/// chunks in a caller's own write queue: cancels and pings. Transport and
/// queueing are out of scope here; this is just the hint callers key off of.
pub(crate) const PRIORITY_OOB: i64 = i64::MAX;

pub(crate) struct SendableMessage {
    id: u32,
    is_response: bool,
    codec: Arc<HeaderCodec>,
    buffer: FeedableBuffer,
    ended: bool,
}

impl SendableMessage {
    pub(crate) fn new(id: u32, is_response: bool, codec: Arc<HeaderCodec>) -> Self {
        let header_len = codec.header_len();
        let max_chunk = codec.max_chunk_len();
        let buffer = FeedableBuffer::new(header_len, header_len + max_chunk);
        Self { id, is_response, codec, buffer, ended: false }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn max_chunk_len(&self) -> usize {
        self.codec.max_chunk_len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    pub(crate) fn has_buffered_payload(&self) -> bool {
        self.buffer.used_over_min() > 0
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    /// Appends payload bytes, up to one frame's worth. Returns whatever
    /// didn't fit; the caller flushes and feeds the remainder into the next
    /// chunk.
    pub(crate) fn feed<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], Error> {
        if self.ended {
            return Err(Error::MessageAlreadyEnded(self.id));
        }
        Ok(self.buffer.feed(data))
    }

    /// Packs the buffered payload into a ready-to-write frame. `end` marks
    /// this as the terminating frame of the stream. Legal even with an
    /// empty buffer (a request or response with no payload still ends with
    /// one zero-length terminating frame). A second call with `end = true`
    /// after the stream already ended is a no-op returning an empty frame,
    /// matching `End`'s idempotence; `feed` after ending still errors.
    pub(crate) fn flush(&mut self, end: bool) -> Result<Vec<u8>, Error> {
        if self.ended {
            return Ok(Vec::new());
        }
        let length = self.buffer.used_over_min() as u32;
        let header = self.codec.encode(self.id, length, self.is_response, end);
        self.buffer.overwrite_head(&header);
        let out = self.buffer.as_slice().to_vec();
        self.buffer.minimize();
        if end {
            self.ended = true;
        }
        Ok(out)
    }

    /// Shorthand for `flush(true)` when there's nothing left to feed.
    /// Idempotent: a second call emits exactly zero further bytes.
    pub(crate) fn end(&mut self) -> Result<Vec<u8>, Error> {
        self.flush(true)
    }
}
