//! Variable-width (1–4 byte) frame header codec.
//!
//! Bit layout (little-endian, packed into `header_bytes`):
//! bit 0 = termination, bit 1 = response, `[2, 2+length_bits)` = payload
//! length, `[2+length_bits, 2+length_bits+id_bits)` = message ID. Anything
//! above that must be zero. Length is packed before ID.

use crate::{buffer::FeedableBuffer, error::Error};

/// Message type, derived from `(length, termination, response)` per the
/// wire-format table, see `SPEC_FULL.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageType {
    Request,
    Response,
    Cancel,
    CancelAck,
    /// Request-side zero-length termination: either the tail of an
    /// already-active request, or a ping. Disambiguated by the facade via
    /// the active-incoming set.
    RequestEmptyTermination,
    /// Response-side zero-length termination: either a genuine empty
    /// response, or a ping-ack. Disambiguated via the ping-tracker.
    EmptyResponse,
}

impl MessageType {
    fn from_fields(length: u32, is_end: bool, is_response: bool) -> Self {
        if length > 0 {
            return if is_response { MessageType::Response } else { MessageType::Request };
        }
        match (is_end, is_response) {
            (true, true) => MessageType::EmptyResponse,
            (true, false) => MessageType::RequestEmptyTermination,
            (false, true) => MessageType::CancelAck,
            (false, false) => MessageType::Cancel,
        }
    }
}

/// A header that was just decoded off the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodedHeader {
    pub id: u32,
    pub length: u32,
    pub is_response: bool,
    pub is_end: bool,
    pub message_type: MessageType,
}

const SHIFT_RESPONSE: u32 = 1;
const SHIFT_LENGTH: u32 = 2;

/// Number of bytes needed to pack `id_bits + length_bits + 2` bits.
pub(crate) fn header_bytes(id_bits: u32, length_bits: u32) -> usize {
    match id_bits + length_bits {
        n if n <= 6 => 1,
        n if n <= 14 => 2,
        n if n <= 22 => 3,
        _ => 4,
    }
}

/// Encodes/decodes headers for one negotiated session geometry. Cycles
/// between frames via [`Self::clear_encoded`]; mid-decode state lives in an
/// internal [`FeedableBuffer`].
pub(crate) struct HeaderCodec {
    id_bits: u32,
    length_bits: u32,
    header_len: usize,
    mask_id: u32,
    mask_length: u32,
    mask_unused: u32,
    shift_id: u32,
    incoming: FeedableBuffer,
}

impl HeaderCodec {
    pub(crate) fn new(id_bits: u32, length_bits: u32) -> Self {
        let header_len = header_bytes(id_bits, length_bits);
        let shift_id = SHIFT_LENGTH + length_bits;
        let total_bits = id_bits + length_bits + 2;
        Self {
            id_bits,
            length_bits,
            header_len,
            mask_id: (1u32 << id_bits) - 1,
            mask_length: (1u32 << length_bits) - 1,
            mask_unused: if total_bits >= 32 { 0 } else { !((1u32 << total_bits) - 1) },
            shift_id,
            incoming: FeedableBuffer::new(0, header_len),
        }
    }

    pub(crate) fn header_len(&self) -> usize {
        self.header_len
    }

    pub(crate) fn max_chunk_len(&self) -> usize {
        self.mask_length as usize
    }

    /// Packs `(id, length, is_response, is_end)` into `header_len` bytes.
    pub(crate) fn encode(&self, id: u32, length: u32, is_response: bool, is_end: bool) -> Vec<u8> {
        let mut out = vec![0u8; self.header_len];
        self.encode_into(&mut out, id, length, is_response, is_end);
        out
    }

    /// Packs into a caller-supplied `header_len`-byte slice. Used by
    /// [`crate::sendable::SendableMessage`] to overwrite a reserved buffer
    /// prefix without an extra allocation.
    pub(crate) fn encode_into(&self, dst: &mut [u8], id: u32, length: u32, is_response: bool, is_end: bool) {
        debug_assert_eq!(dst.len(), self.header_len);
        let mut fields = u32::from(is_end)
            | (u32::from(is_response) << SHIFT_RESPONSE)
            | (length << SHIFT_LENGTH)
            | (id << self.shift_id);
        for byte in dst.iter_mut() {
            *byte = fields as u8;
            fields >>= 8;
        }
    }

    /// Convenience for the zero-length control types. Refuses
    /// `Request`/`Response`. Those always carry payload and are only ever
    /// produced by [`Self::encode`].
    pub(crate) fn encode_zero(&self, id: u32, message_type: MessageType) -> Vec<u8> {
        let (is_response, is_end) = match message_type {
            MessageType::Cancel => (false, false),
            MessageType::CancelAck => (true, false),
            MessageType::RequestEmptyTermination => (false, true),
            MessageType::EmptyResponse => (true, true),
            MessageType::Request | MessageType::Response => {
                panic!("encode_zero cannot be used for message type {message_type:?}")
            }
        };
        self.encode(id, 0, is_response, is_end)
    }

    pub(crate) fn is_decoded(&self) -> bool {
        self.incoming.is_full()
    }

    pub(crate) fn clear_encoded(&mut self) {
        self.incoming = FeedableBuffer::new(0, self.header_len);
    }

    /// Feeds bytes into the in-progress header. Once `header_len` bytes have
    /// accumulated, unpacks and returns the decoded header alongside
    /// whatever of `stream` wasn't consumed.
    pub(crate) fn feed<'a>(&mut self, stream: &'a [u8]) -> Result<(&'a [u8], Option<DecodedHeader>), Error> {
        let remaining = self.incoming.feed(stream);
        if !self.incoming.is_full() {
            return Ok((remaining, None));
        }

        let mut fields: u32 = 0;
        for &byte in self.incoming.as_slice().iter().rev() {
            fields = (fields << 8) | u32::from(byte);
        }

        if fields & self.mask_unused != 0 {
            return Err(Error::MalformedHeader(fields & self.mask_unused));
        }

        let is_end = fields & 1 == 1;
        let is_response = (fields >> SHIFT_RESPONSE) & 1 == 1;
        let id = (fields >> self.shift_id) & self.mask_id;
        let length = (fields >> SHIFT_LENGTH) & self.mask_length;
        let message_type = MessageType::from_fields(length, is_end, is_response);

        Ok((remaining, Some(DecodedHeader { id, length, is_response, is_end, message_type })))
    }

    #[cfg(test)]
    pub(crate) fn id_bits(&self) -> u32 {
        self.id_bits
    }

    #[cfg(test)]
    pub(crate) fn length_bits(&self) -> u32 {
        self.length_bits
    }
}
