// src/buffer.rs

use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Growth unit for connection buffers. Capacity is always a multiple of this.
pub const MAX_BUFFER_SIZE: usize = 4096;

/// Hard cap on descriptors per underlying send or receive, imposed by the
/// transport's ancillary-data limit.
pub const MAX_FDS: usize = 28;

/// One direction of a connection: an append-only byte area that grows
/// geometrically, a small descriptor sequence, and a read cursor.
///
/// The inbound side uses `offset`, `pending` and `update`; the outbound side
/// only appends and flushes.
pub struct Buffer {
    /// Backing storage. `storage.len()` is the capacity; bytes past `size`
    /// are spare room for the next receive or reservation.
    pub(crate) storage: Vec<u8>,
    /// Bytes currently holding data.
    pub(crate) size: usize,
    /// Read cursor (inbound only).
    pub(crate) offset: usize,
    /// Length of the most recently delivered message, consumed by the next
    /// read call (inbound only).
    pub(crate) pending: usize,
    /// Staged descriptors (outbound) or descriptors recovered from the most
    /// recent receive (inbound). Values only; this buffer never closes them.
    pub(crate) fds: Vec<RawFd>,
    /// True when no fully-parsed-but-undelivered message is buffered and a
    /// new receive is required (inbound only).
    pub(crate) update: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            storage: vec![0; MAX_BUFFER_SIZE],
            size: 0,
            offset: 0,
            pending: 0,
            fds: Vec::with_capacity(MAX_FDS),
            update: false,
        }
    }

    /// Make room for `additional` bytes past the current used size, growing
    /// the capacity to the next multiple of [`MAX_BUFFER_SIZE`] if needed,
    /// and return the writable span starting at the used size.
    ///
    /// Idempotent for identical sizing; never advances `size`. Growth moves
    /// the storage, so spans from earlier calls must be re-derived.
    pub fn ensure_size(&mut self, additional: usize) -> &mut [u8] {
        let needed = self.size + additional;
        if needed > self.storage.len() {
            let new_capacity = needed.div_ceil(MAX_BUFFER_SIZE) * MAX_BUFFER_SIZE;
            tracing::warn!(
                "resizing buffer {} + {} -> {}",
                self.size,
                additional,
                new_capacity
            );
            self.storage.resize(new_capacity, 0);
        }
        let size = self.size;
        &mut self.storage[size..size + additional]
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Stage a descriptor for the next flush, collapsing duplicates by
    /// value; returns the ancillary slot index it will occupy.
    pub fn add_fd(&mut self, fd: RawFd) -> Result<u32> {
        if let Some(index) = self.fds.iter().position(|&staged| staged == fd) {
            return Ok(index as u32);
        }
        if self.fds.len() >= MAX_FDS {
            tracing::error!("too many fds staged, cap is {}", MAX_FDS);
            return Err(Error::TooManyDescriptors);
        }
        self.fds.push(fd);
        Ok((self.fds.len() - 1) as u32)
    }

    /// Look up a descriptor recovered from the most recent receive.
    /// Out of range is `None`, not an error.
    pub fn get_fd(&self, index: u32) -> Option<RawFd> {
        self.fds.get(index as usize).copied()
    }

    /// Reset to empty, discarding buffered bytes and descriptor bookkeeping.
    /// Capacity is retained for the life of the connection.
    pub fn clear(&mut self) {
        self.size = 0;
        self.offset = 0;
        self.pending = 0;
        self.fds.clear();
    }

    /// Account for a (possibly short) send that accepted `accepted` bytes:
    /// keep the unsent remainder at the front of the buffer and drop the
    /// staged descriptor sequence.
    ///
    /// Descriptors are cleared unconditionally, even on a short send; the
    /// policy lives here so it can be changed in one place.
    pub fn complete_send(&mut self, accepted: usize) {
        debug_assert!(accepted <= self.size);
        self.storage.copy_within(accepted..self.size, 0);
        self.size -= accepted;
        self.fds.clear();
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_one_page() {
        let buf = Buffer::new();
        assert_eq!(buf.capacity(), MAX_BUFFER_SIZE);
        assert_eq!(buf.size, 0);
    }

    #[test]
    fn ensure_size_rounds_to_page_multiple() {
        let mut buf = Buffer::new();

        // Fits in the initial page: no growth.
        let span = buf.ensure_size(100);
        assert_eq!(span.len(), 100);
        assert_eq!(buf.capacity(), 4096);

        buf.size = 4000;
        buf.ensure_size(96);
        assert_eq!(buf.capacity(), 4096);

        buf.ensure_size(97);
        assert_eq!(buf.capacity(), 8192);

        buf.ensure_size(10000);
        assert_eq!(buf.capacity(), 16384);
    }

    #[test]
    fn ensure_size_is_idempotent() {
        let mut buf = Buffer::new();
        buf.size = 10;
        buf.ensure_size(5000);
        let capacity = buf.capacity();
        buf.ensure_size(5000);
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn ensure_size_preserves_existing_bytes() {
        let mut buf = Buffer::new();
        buf.ensure_size(4).copy_from_slice(&[1, 2, 3, 4]);
        buf.size = 4;
        buf.ensure_size(8000);
        assert_eq!(&buf.storage[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn add_fd_dedups_by_value() {
        let mut buf = Buffer::new();
        assert_eq!(buf.add_fd(10).unwrap(), 0);
        assert_eq!(buf.add_fd(11).unwrap(), 1);
        assert_eq!(buf.add_fd(10).unwrap(), 0);
        assert_eq!(buf.fds.len(), 2);
    }

    #[test]
    fn add_fd_fails_past_cap() {
        let mut buf = Buffer::new();
        for i in 0..MAX_FDS {
            buf.add_fd(100 + i as RawFd).unwrap();
        }
        assert!(matches!(buf.add_fd(999), Err(Error::TooManyDescriptors)));
        assert_eq!(buf.fds.len(), MAX_FDS);

        // A duplicate still resolves even at the cap.
        assert_eq!(buf.add_fd(100).unwrap(), 0);
    }

    #[test]
    fn get_fd_out_of_range_is_none() {
        let mut buf = Buffer::new();
        assert_eq!(buf.get_fd(0), None);
        buf.fds.push(42);
        assert_eq!(buf.get_fd(0), Some(42));
        assert_eq!(buf.get_fd(1), None);
    }

    #[test]
    fn complete_send_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.ensure_size(6).copy_from_slice(b"abcdef");
        buf.size = 6;
        buf.add_fd(7).unwrap();

        buf.complete_send(4);
        assert_eq!(buf.size, 2);
        assert_eq!(&buf.storage[..2], b"ef");
        // Short send still drops every staged descriptor.
        assert!(buf.fds.is_empty());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut buf = Buffer::new();
        buf.ensure_size(3).copy_from_slice(b"xyz");
        buf.size = 3;
        buf.offset = 1;
        buf.fds.push(5);

        buf.clear();
        assert_eq!((buf.size, buf.offset, buf.pending), (0, 0, 0));
        assert!(buf.fds.is_empty());

        buf.clear();
        assert_eq!((buf.size, buf.offset, buf.pending), (0, 0, 0));
    }
}
