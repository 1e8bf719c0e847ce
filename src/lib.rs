//! Transport core for shared-memory IPC: a point-to-point message channel
//! over a local socket, multiplexing a length-prefixed byte protocol with an
//! ancillary channel that passes open file descriptors (so shared memory
//! regions cross process boundaries without copying payload data).
//!
//! The crate is opcode- and payload-agnostic: it moves opaque bytes tagged
//! with a destination id and an opcode, plus the descriptors staged alongside
//! them. Driving the socket (poll loop, blocking mode) stays with the caller.

pub mod buffer;
pub mod connection;
pub mod error;
pub mod mem;
pub mod signal;

pub use buffer::{MAX_BUFFER_SIZE, MAX_FDS};
pub use connection::{Connection, Message, HEADER_SIZE, MAX_PAYLOAD};
pub use error::{Error, Result};
pub use mem::{MemBlock, MemFlags};
pub use signal::{Signal, SignalId};
