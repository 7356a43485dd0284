pub mod reader;
pub mod writer;

pub use reader::ReaderError;
pub use writer::WriterError;

use std::collections::HashMap;

/// Byte buffer a DNS message is read from or assembled into.
///
/// Writes are bounded by `limit` so an answer can never outgrow what the
/// client negotiated; reads are bounded by the received wire length.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub buf: Vec<u8>,
    pub pos: usize,
    limit: usize,
    writing_labels: HashMap<String, usize>,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::with_limit(crate::MIN_PKTSIZE)
    }
}

impl PacketBuffer {
    /// Fresh buffer for assembling a message of at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            limit: limit.min(crate::MAX_PKTSIZE),
            writing_labels: HashMap::new(),
        }
    }

    /// Wrap received wire bytes for parsing.
    pub fn from_wire(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            pos: 0,
            limit: crate::MAX_PKTSIZE,
            writing_labels: HashMap::new(),
        }
    }

    /// Current position within the buffer
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Message wire bytes.
    pub fn wire(&self) -> &[u8] {
        &self.buf
    }
}
