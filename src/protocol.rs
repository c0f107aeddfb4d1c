//! Echo framing for the chat-echo line protocol.
//!
//! Inbound messages are raw bytes with no delimiter. Each accepted message
//! is echoed back followed by a single `\n`:
//!
//! ```text
//! Client sends: hello
//! Server sends: hello\n
//! ```
//!
//! A message is rejected when `len + 1` exceeds the write buffer capacity.
//! Rejected messages produce no response; the connection keeps reading.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Read buffer size used by the reference configuration.
pub const DEFAULT_READ_CAPACITY: usize = 32;

/// Write buffer size used by the reference configuration.
pub const DEFAULT_WRITE_CAPACITY: usize = 32;

/// Upper bound for either buffer; both are allocated per connection.
pub const MAX_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

/// Terminator appended to every echoed message.
pub const TERMINATOR: u8 = b'\n';

/// Fixed per-connection buffer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    read_capacity: usize,
    write_capacity: usize,
}

impl BufferLimits {
    /// Create buffer limits. Both capacities must be in
    /// `1..=MAX_BUFFER_CAPACITY`.
    pub fn new(read_capacity: usize, write_capacity: usize) -> Option<Self> {
        let valid = 1..=MAX_BUFFER_CAPACITY;
        if !valid.contains(&read_capacity) || !valid.contains(&write_capacity) {
            return None;
        }
        Some(Self {
            read_capacity,
            write_capacity,
        })
    }

    pub fn read_capacity(&self) -> usize {
        self.read_capacity
    }

    pub fn write_capacity(&self) -> usize {
        self.write_capacity
    }

    /// Whether a full read buffer always fits in the write buffer with its
    /// terminator (`write >= read + 1`).
    ///
    /// When this is false, reads that fill the read buffer are rejected.
    pub fn accepts_every_read(&self) -> bool {
        self.write_capacity > self.read_capacity
    }

    /// Largest message that can be echoed.
    pub fn max_message_len(&self) -> usize {
        self.write_capacity - 1
    }
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            read_capacity: DEFAULT_READ_CAPACITY,
            write_capacity: DEFAULT_WRITE_CAPACITY,
        }
    }
}

/// A message did not fit in the write buffer with its terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTooLarge {
    /// Message length plus the terminator.
    pub size: usize,
    /// Write buffer capacity.
    pub capacity: usize,
}

impl fmt::Display for MessageTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message too large for write buffer (size {}, max {})",
            self.size, self.capacity
        )
    }
}

impl std::error::Error for MessageTooLarge {}

/// Frame `message` into `output` as `message\n`.
///
/// The output buffer is cleared first and never grows beyond `capacity`.
/// Returns the number of bytes to write.
pub fn frame_message(
    message: &[u8],
    output: &mut BytesMut,
    capacity: usize,
) -> Result<usize, MessageTooLarge> {
    let size = message.len() + 1;
    if size > capacity {
        return Err(MessageTooLarge { size, capacity });
    }

    output.clear();
    output.extend_from_slice(message);
    output.put_u8(TERMINATOR);
    Ok(size)
}
