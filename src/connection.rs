// src/connection.rs

use std::io;
use std::os::fd::RawFd;

use crate::buffer::{Buffer, MAX_FDS};
use crate::error::{Error, Result};
use crate::signal::Signal;

/// Fixed message header: dest_id (4 bytes) then opcode/length word (4 bytes).
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can carry.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

// Ancillary scratch space, u64-aligned for cmsghdr. CMSG_SPACE for 28
// descriptors is well under 256 bytes on every supported platform.
const CMSG_WORDS: usize = 32;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// One parsed inbound message: a view into the connection's inbound buffer,
/// valid until the next call on the connection.
#[derive(Debug)]
pub struct Message<'a> {
    pub dest_id: u32,
    pub opcode: u8,
    pub data: &'a [u8],
    fds: &'a [RawFd],
}

impl Message<'_> {
    /// Resolve a descriptor index carried in this message's payload against
    /// the descriptors that arrived alongside it. Out of range is `None`.
    pub fn fd(&self, index: u32) -> Option<RawFd> {
        self.fds.get(index as usize).copied()
    }
}

/// A point-to-point message channel over a connected local socket.
///
/// Multiplexes a length-prefixed byte protocol with an ancillary channel for
/// passing open file descriptors. Strictly single-threaded: an external event
/// loop calls [`get_next`] when the socket is readable and [`flush`] when it
/// is writable (and `need_flush` has been raised).
///
/// The connection uses the socket descriptor for its whole lifetime but does
/// not close it; descriptor lifetime and blocking mode stay with the caller.
///
/// [`get_next`]: Connection::get_next
/// [`flush`]: Connection::flush
pub struct Connection {
    fd: RawFd,
    input: Buffer,
    output: Buffer,
    /// Raised by [`end_write`] when buffered output awaits a flush.
    ///
    /// [`end_write`]: Connection::end_write
    pub need_flush: Signal,
    /// Raised when the connection is dropped, before its buffers go away.
    pub destroy: Signal,
    /// Underlying receive calls issued so far.
    recv_calls: u64,
}

impl Connection {
    /// Wrap an already-connected local socket descriptor.
    pub fn new(fd: RawFd) -> Connection {
        tracing::debug!("connection fd {}: new", fd);
        let mut input = Buffer::new();
        input.update = true;
        Connection {
            fd,
            input,
            output: Buffer::new(),
            need_flush: Signal::new(),
            destroy: Signal::new(),
            recv_calls: 0,
        }
    }

    /// The socket descriptor, for the caller's event loop to poll.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Stage a descriptor for transmission with the next flush.
    ///
    /// Duplicate values collapse to one ancillary slot; the returned index is
    /// what the message payload should reference. A negative value is carried
    /// as its absolute value on the wire (the sign is a caller-private flag
    /// this transport does not interpret).
    pub fn add_fd(&mut self, fd: RawFd) -> Result<u32> {
        self.output.add_fd(fd)
    }

    /// Look up a descriptor that arrived with the most recent receive.
    pub fn get_fd(&self, index: u32) -> Option<RawFd> {
        self.input.get_fd(index)
    }

    /// Parse the next buffered inbound message, receiving more bytes from
    /// the socket when needed (at most one receive per call unless a message
    /// spans several receives).
    ///
    /// `Ok(None)` means nothing is buffered right now; try again once the
    /// event loop reports the socket readable. The returned view is valid
    /// only until the next call on this connection.
    pub fn get_next(&mut self) -> Result<Option<Message<'_>>> {
        // Consume the previously delivered message.
        self.input.offset += self.input.pending;
        self.input.pending = 0;

        let (dest_id, opcode, len, start) = loop {
            if self.input.update {
                self.refill_input()?;
                self.input.update = false;
            }

            if self.input.offset >= self.input.size {
                self.input.clear();
                self.input.update = true;
                return Ok(None);
            }

            let avail = self.input.size - self.input.offset;
            if avail < HEADER_SIZE {
                self.input.ensure_size(HEADER_SIZE);
                self.input.update = true;
                continue;
            }

            let at = self.input.offset;
            let head = &self.input.storage[at..at + HEADER_SIZE];
            let dest_id = u32::from_ne_bytes(head[0..4].try_into().unwrap());
            let word = u32::from_ne_bytes(head[4..8].try_into().unwrap());
            let opcode = (word >> 24) as u8;
            let len = (word as usize) & MAX_PAYLOAD;

            if len > avail - HEADER_SIZE {
                // The message legitimately spans receives; make room for all
                // of it and go read some more.
                self.input.ensure_size(HEADER_SIZE + len);
                self.input.update = true;
                continue;
            }

            self.input.offset += HEADER_SIZE;
            self.input.pending = len;
            break (dest_id, opcode, len, self.input.offset);
        };

        let data = &self.input.storage[start..start + len];
        Ok(Some(Message {
            dest_id,
            opcode,
            data,
            fds: &self.input.fds,
        }))
    }

    /// Reserve room for one outbound message of `size` payload bytes and
    /// return the payload span for the caller to fill directly.
    ///
    /// The span is valid until the next mutating call on this connection;
    /// commit it with [`end_write`] using the same `size`.
    ///
    /// [`end_write`]: Connection::end_write
    pub fn begin_write(&mut self, size: u32) -> &mut [u8] {
        let reserved = self.output.ensure_size(HEADER_SIZE + size as usize);
        &mut reserved[HEADER_SIZE..]
    }

    /// Commit the message filled in after [`begin_write`]: write its header,
    /// account for the bytes, and raise `need_flush`.
    ///
    /// `size` must match the matching `begin_write` and fit the 24-bit
    /// length field.
    ///
    /// [`begin_write`]: Connection::begin_write
    pub fn end_write(&mut self, dest_id: u32, opcode: u8, size: u32) {
        debug_assert!(
            size as usize <= MAX_PAYLOAD,
            "payload exceeds 24-bit length field"
        );
        let word = ((opcode as u32) << 24) | (size & MAX_PAYLOAD as u32);

        // Idempotent for the sizing begin_write used; re-derives the same
        // reservation even if nothing was written in between.
        let reserved = self.output.ensure_size(HEADER_SIZE + size as usize);
        reserved[0..4].copy_from_slice(&dest_id.to_ne_bytes());
        reserved[4..8].copy_from_slice(&word.to_ne_bytes());

        self.output.size += HEADER_SIZE + size as usize;
        self.need_flush.emit();
    }

    /// Send all buffered outbound bytes and staged descriptors in one
    /// underlying call.
    ///
    /// A short send is not an error: the remainder stays buffered for a
    /// future flush. Staged descriptors are consumed by any successful send.
    pub fn flush(&mut self) -> Result<()> {
        let buf = &mut self.output;
        if buf.size == 0 {
            return Ok(());
        }

        let mut iov = libc::iovec {
            iov_base: buf.storage.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.size,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let mut cmsg_space = [0u64; CMSG_WORDS];
        if !buf.fds.is_empty() {
            let fds_len = buf.fds.len() * std::mem::size_of::<RawFd>();
            msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = unsafe { libc::CMSG_SPACE(fds_len as u32) } as _;

            let cmsg = unsafe { &mut *libc::CMSG_FIRSTHDR(&msg) };
            cmsg.cmsg_level = libc::SOL_SOCKET;
            cmsg.cmsg_type = libc::SCM_RIGHTS;
            cmsg.cmsg_len = unsafe { libc::CMSG_LEN(fds_len as u32) } as _;
            let slots = unsafe { libc::CMSG_DATA(cmsg) } as *mut RawFd;
            for (i, &fd) in buf.fds.iter().enumerate() {
                // The wire always carries the absolute descriptor; a negative
                // staged value is a caller-private flag.
                unsafe { std::ptr::write_unaligned(slots.add(i), fd.abs()) };
            }
            msg.msg_controllen = cmsg.cmsg_len as _;
        }

        let sent = loop {
            let n = unsafe { libc::sendmsg(self.fd, &msg, SEND_FLAGS) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("fd {}: could not sendmsg: {}", self.fd, err);
                return Err(Error::System(err));
            }
            break n as usize;
        };

        tracing::trace!(
            "fd {}: wrote {} bytes and {} fds",
            self.fd,
            sent,
            buf.fds.len()
        );
        buf.complete_send(sent);
        Ok(())
    }

    /// Drop all unread and unflushed data and descriptors on both sides.
    pub fn clear(&mut self) {
        self.output.clear();
        self.input.clear();
        self.input.update = true;
    }

    /// One receive into the inbound buffer's spare capacity, merging any
    /// descriptors that arrived alongside the bytes. Retries on EINTR only.
    fn refill_input(&mut self) -> Result<()> {
        let buf = &mut self.input;
        let spare_at = buf.size;
        let spare_len = buf.storage.len() - buf.size;

        let mut iov = libc::iovec {
            iov_base: unsafe { buf.storage.as_mut_ptr().add(spare_at) } as *mut libc::c_void,
            iov_len: spare_len,
        };
        let mut cmsg_space = [0u64; CMSG_WORDS];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&cmsg_space) as _;

        let received = loop {
            self.recv_calls += 1;
            let n = unsafe { libc::recvmsg(self.fd, &mut msg, RECV_FLAGS) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("fd {}: could not recvmsg: {}", self.fd, err);
                return Err(Error::System(err));
            }
            if n == 0 {
                return Err(Error::System(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            break n as usize;
        };

        buf.size += received;

        // Descriptors from the most recent receive replace the held
        // sequence; a receive with no rights payload leaves it alone.
        let mut rights: Option<Vec<RawFd>> = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let (level, kind, cmsg_len) =
                unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
            if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                let data = unsafe { libc::CMSG_DATA(cmsg) };
                let header_len = data as usize - cmsg as usize;
                let count = (cmsg_len as usize).saturating_sub(header_len)
                    / std::mem::size_of::<RawFd>();
                let count = count.min(MAX_FDS);
                let mut fds = Vec::with_capacity(count);
                for i in 0..count {
                    fds.push(unsafe { std::ptr::read_unaligned((data as *const RawFd).add(i)) });
                }
                rights = Some(fds);
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }
        if let Some(fds) = rights {
            buf.fds = fds;
        }

        tracing::trace!(
            "fd {}: read {} bytes and {} fds",
            self.fd,
            received,
            buf.fds.len()
        );
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!("connection fd {}: destroy", self.fd);
        self.destroy.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    fn encode(dest_id: u32, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let word = ((opcode as u32) << 24) | payload.len() as u32;
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&dest_id.to_ne_bytes());
        bytes.extend_from_slice(&word.to_ne_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn write_message(conn: &mut Connection, dest_id: u32, opcode: u8, payload: &[u8]) {
        conn.begin_write(payload.len() as u32)[..payload.len()].copy_from_slice(payload);
        conn.end_write(dest_id, opcode, payload.len() as u32);
    }

    #[test]
    fn round_trip_one_message() {
        let (a, b) = pair();
        let mut tx = Connection::new(a.as_raw_fd());
        let mut rx = Connection::new(b.as_raw_fd());

        write_message(&mut tx, 5, 7, &[1, 2, 3]);
        tx.flush().unwrap();

        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.dest_id, 5);
        assert_eq!(msg.opcode, 7);
        assert_eq!(msg.data, &[1, 2, 3]);
        drop(msg);

        assert!(rx.get_next().unwrap().is_none());
    }

    #[test]
    fn empty_payload_round_trips() {
        let (a, b) = pair();
        let mut tx = Connection::new(a.as_raw_fd());
        let mut rx = Connection::new(b.as_raw_fd());

        write_message(&mut tx, 1, 200, &[]);
        tx.flush().unwrap();

        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.dest_id, 1);
        assert_eq!(msg.opcode, 200);
        assert!(msg.data.is_empty());
    }

    #[test]
    fn three_messages_one_flush_one_receive() {
        let (a, b) = pair();
        let mut tx = Connection::new(a.as_raw_fd());
        let mut rx = Connection::new(b.as_raw_fd());

        write_message(&mut tx, 1, 10, b"first");
        write_message(&mut tx, 2, 20, b"second");
        write_message(&mut tx, 3, 30, b"third");
        tx.flush().unwrap();

        for (dest_id, opcode, payload) in
            [(1u32, 10u8, &b"first"[..]), (2, 20, &b"second"[..]), (3, 30, &b"third"[..])]
        {
            let msg = rx.get_next().unwrap().unwrap();
            assert_eq!(msg.dest_id, dest_id);
            assert_eq!(msg.opcode, opcode);
            assert_eq!(msg.data, payload);
        }

        assert!(rx.get_next().unwrap().is_none());
        // All three came off a single underlying receive.
        assert_eq!(rx.recv_calls, 1);
    }

    #[test]
    fn partial_header_retries_receive() {
        let (mut a, b) = pair();
        b.set_nonblocking(true).unwrap();
        let mut rx = Connection::new(b.as_raw_fd());

        let bytes = encode(9, 2, b"abcd");
        a.write_all(&bytes[..5]).unwrap();

        // 5 bytes buffered is not a header yet; the state machine must retry
        // the receive before giving up, and the retry hits EAGAIN.
        match rx.get_next() {
            Err(Error::System(err)) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            other => panic!("expected WouldBlock, got {:?}", other.map(|m| m.is_some())),
        }
        assert_eq!(rx.recv_calls, 2);

        a.write_all(&bytes[5..]).unwrap();
        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.dest_id, 9);
        assert_eq!(msg.opcode, 2);
        assert_eq!(msg.data, b"abcd");
        drop(msg);
        assert_eq!(rx.recv_calls, 3);
    }

    #[test]
    fn payload_filling_spare_capacity_grows_once() {
        let (mut a, b) = pair();
        b.set_nonblocking(true).unwrap();
        let mut rx = Connection::new(b.as_raw_fd());

        // Header only; the declared payload exactly fills what the grown
        // buffer has spare (8 + 4088 = one page).
        let payload = vec![0xAB; 4088];
        let bytes = encode(4, 1, &payload);
        a.write_all(&bytes[..HEADER_SIZE]).unwrap();

        match rx.get_next() {
            Err(Error::System(err)) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            other => panic!("expected WouldBlock, got {:?}", other.map(|m| m.is_some())),
        }
        // One growth cycle, not two.
        assert_eq!(rx.input.capacity(), 8192);

        a.write_all(&bytes[HEADER_SIZE..]).unwrap();
        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.data.len(), 4088);
        drop(msg);
        assert_eq!(rx.input.capacity(), 8192);
    }

    #[test]
    fn large_message_spans_receives() {
        let (a, b) = pair();
        let mut tx = Connection::new(a.as_raw_fd());
        let mut rx = Connection::new(b.as_raw_fd());

        let payload: Vec<u8> = (0..8000u32).map(|i| i as u8).collect();
        write_message(&mut tx, 77, 3, &payload);
        tx.flush().unwrap();

        let msg = rx.get_next().unwrap().unwrap();
        assert_eq!(msg.dest_id, 77);
        assert_eq!(msg.data, &payload[..]);
        drop(msg);

        // The first receive could only fill the initial page.
        assert!(rx.recv_calls >= 2);
    }

    #[test]
    fn peer_close_is_an_error() {
        let (a, b) = pair();
        let mut rx = Connection::new(b.as_raw_fd());
        drop(a);

        match rx.get_next() {
            Err(Error::System(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof error, got {:?}", other.map(|m| m.is_some())),
        }
    }

    #[test]
    fn flush_with_nothing_buffered_is_ok() {
        let (a, _b) = pair();
        let mut conn = Connection::new(a.as_raw_fd());
        conn.flush().unwrap();
        conn.flush().unwrap();
    }

    #[test]
    fn clear_discards_unflushed_output() {
        let (a, b) = pair();
        b.set_nonblocking(true).unwrap();
        let mut tx = Connection::new(a.as_raw_fd());
        let mut rx = Connection::new(b.as_raw_fd());

        write_message(&mut tx, 1, 1, b"dropped");
        tx.clear();
        tx.clear();
        tx.flush().unwrap();

        match rx.get_next() {
            Err(Error::System(err)) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            other => panic!("expected WouldBlock, got {:?}", other.map(|m| m.is_some())),
        }
    }

    #[test]
    fn staged_fds_dedup_and_cap() {
        let (a, _b) = pair();
        let mut conn = Connection::new(a.as_raw_fd());

        for i in 0..MAX_FDS {
            assert_eq!(conn.add_fd(100 + i as RawFd).unwrap(), i as u32);
        }
        assert!(matches!(conn.add_fd(999), Err(Error::TooManyDescriptors)));
        assert_eq!(conn.add_fd(100).unwrap(), 0);
    }

    #[test]
    fn get_fd_without_receive_is_none() {
        let (a, _b) = pair();
        let conn = Connection::new(a.as_raw_fd());
        assert_eq!(conn.get_fd(0), None);
    }

    #[test]
    fn end_write_raises_need_flush() {
        let (a, _b) = pair();
        let mut conn = Connection::new(a.as_raw_fd());

        let raised = Rc::new(Cell::new(0u32));
        let raised2 = raised.clone();
        conn.need_flush.connect(move || raised2.set(raised2.get() + 1));

        write_message(&mut conn, 1, 1, b"x");
        assert_eq!(raised.get(), 1);
        write_message(&mut conn, 1, 1, b"y");
        assert_eq!(raised.get(), 2);
    }

    #[test]
    fn drop_raises_destroy() {
        let (a, _b) = pair();
        let mut conn = Connection::new(a.as_raw_fd());

        let destroyed = Rc::new(Cell::new(false));
        let destroyed2 = destroyed.clone();
        conn.destroy.connect(move || destroyed2.set(true));

        drop(conn);
        assert!(destroyed.get());
    }
}
