//! Fixed `[min, max]` byte accumulator.
//!
//! The "min floor" lets [`crate::sendable::SendableMessage`] reserve header
//! bytes in the same allocation as the payload, so a flush is always one
//! contiguous slice instead of a header alloc plus a payload alloc.

/// Accumulates bytes up to `max`, never shrinking below `min`.
#[derive(Debug)]
pub(crate) struct FeedableBuffer {
    data: Vec<u8>,
    min: usize,
    max: usize,
}

impl FeedableBuffer {
    pub(crate) fn new(min: usize, max: usize) -> Self {
        debug_assert!(min <= max);
        Self { data: vec![0u8; min], min, max }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.data.len() == self.max
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.data.len() == self.min
    }

    #[inline]
    pub(crate) fn minimize(&mut self) {
        self.data.truncate(self.min);
    }

    /// Extends the buffer up to `max`. The newly exposed region's contents
    /// are unspecified (not zeroed). Callers overwrite it before reading.
    #[inline]
    pub(crate) fn maximize(&mut self) {
        self.data.resize(self.max, 0);
    }

    #[inline]
    pub(crate) fn free(&self) -> usize {
        self.max - self.data.len()
    }

    #[inline]
    pub(crate) fn used_over_min(&self) -> usize {
        self.data.len() - self.min
    }

    /// Overwrites `data[..bytes.len()]` in place. Used to stamp an encoded
    /// header into the reserved prefix right before a flush.
    #[inline]
    pub(crate) fn overwrite_head(&mut self, bytes: &[u8]) {
        self.data[..bytes.len()].copy_from_slice(bytes);
    }

    /// Consumes as much of `src` as fits (bounded by `free()`), returning
    /// whatever didn't fit.
    pub(crate) fn feed<'a>(&mut self, src: &'a [u8]) -> &'a [u8] {
        let take = self.free().min(src.len());
        self.data.extend_from_slice(&src[..take]);
        &src[take..]
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_fills_then_returns_remainder() {
        let mut buf = FeedableBuffer::new(2, 5);
        assert!(buf.is_empty());
        let rest = buf.feed(&[1, 2, 3, 4, 5, 6]);
        assert!(buf.is_full());
        assert_eq!(buf.as_slice(), &[0, 0, 1, 2, 3]);
        assert_eq!(rest, &[4, 5, 6]);
    }

    #[test]
    fn minimize_then_maximize_roundtrips_len() {
        let mut buf = FeedableBuffer::new(3, 10);
        buf.feed(&[9u8; 7]);
        assert!(buf.is_full());
        buf.minimize();
        assert!(buf.is_empty());
        assert_eq!(buf.used_over_min(), 0);
        buf.maximize();
        assert!(buf.is_full());
    }

    #[test]
    fn overwrite_head_only_touches_prefix() {
        let mut buf = FeedableBuffer::new(4, 4);
        buf.overwrite_head(&[0xaa, 0xbb]);
        assert_eq!(buf.as_slice(), &[0xaa, 0xbb, 0, 0]);
    }
}
