//! Incremental frame decoder: header, then its payload, repeat.
//!
//! Payload bytes are handed back as borrowed slices of whatever was fed in.
//! This type never copies or buffers payload itself, only the header.

use crate::header::{DecodedHeader, HeaderCodec, MessageType};
use crate::error::Error;

/// One delivery out of the decoder: either a zero-length control frame
/// (`data` always empty), or a slice of an in-progress frame's payload.
/// `header.is_end` is only ever `true` on the slice that finishes the frame.
pub(crate) struct Frame<'a> {
    pub header: DecodedHeader,
    pub data: &'a [u8],
}

pub(crate) struct FrameDecoder {
    codec: HeaderCodec,
    pending_header: Option<DecodedHeader>,
    remaining: u32,
}

impl FrameDecoder {
    pub(crate) fn new(id_bits: u32, length_bits: u32) -> Self {
        Self { codec: HeaderCodec::new(id_bits, length_bits), pending_header: None, remaining: 0 }
    }

    /// Feeds the next chunk of the transport stream. Returns whatever of
    /// `stream` wasn't consumed alongside at most one decoded [`Frame`].
    /// Callers loop, re-feeding the remainder, until this returns `None`.
    pub(crate) fn feed<'a>(&mut self, stream: &'a [u8]) -> Result<(&'a [u8], Option<Frame<'a>>), Error> {
        if let Some(header) = self.pending_header {
            if stream.is_empty() {
                return Ok((stream, None));
            }
            let take = (self.remaining as usize).min(stream.len());
            let (chunk, rest) = stream.split_at(take);
            self.remaining -= take as u32;
            let finished = self.remaining == 0;
            if finished {
                self.pending_header = None;
            }
            return Ok((rest, Some(Frame { header: DecodedHeader { is_end: finished && header.is_end, ..header }, data: chunk })));
        }

        let (rest, decoded) = self.codec.feed(stream)?;
        let Some(header) = decoded else {
            return Ok((rest, None));
        };
        self.codec.clear_encoded();

        if header.length == 0 {
            return Ok((rest, Some(Frame { header, data: &[] })));
        }

        self.pending_header = Some(header);
        self.remaining = header.length;
        self.feed(rest)
    }
}
