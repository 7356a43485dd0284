//! DNS/TCP message framing: a 16-bit network-order length prefix before
//! each message, delivered by the peer in arbitrary chunks.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated length prefix")]
    MsgSize,
    #[error("message exceeds the assembly buffer")]
    Overflow,
}

/// Length of the framed message, when at least the prefix arrived.
pub fn msg_size(msg: &[u8]) -> Result<u16, FrameError> {
    if msg.len() < 2 {
        return Err(FrameError::MsgSize);
    }
    Ok(u16::from_be_bytes([msg[0], msg[1]]))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Feed<'a> {
    /// The chunk carried exactly one whole message: a borrowed view, no
    /// copy into the assembly buffer.
    Complete(&'a [u8]),
    /// A message finished assembling across chunks.
    Assembled(Vec<u8>),
    /// More bytes still to come.
    Pending(usize),
}

/// Reassembles length-prefixed messages from a TCP byte stream.
#[derive(Debug)]
pub struct StreamAssembly {
    pending: Vec<u8>,
    limit: usize,
}

impl StreamAssembly {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// True while a message is mid-assembly; the caller must not multiplex
    /// other work onto the buffer until it drains.
    pub fn is_assembling(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Bytes still owed by the peer for the current message.
    pub fn bytes_remaining(&self) -> usize {
        if self.pending.len() < 2 {
            return if self.pending.is_empty() {
                0
            } else {
                2 - self.pending.len()
            };
        }
        let nbytes = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
        nbytes.saturating_sub(self.pending.len() - 2)
    }

    pub fn feed<'a>(&mut self, chunk: &'a [u8]) -> Result<Feed<'a>, FrameError> {
        // Fast path: a fresh chunk holding exactly one message needs no
        // buffering at all.
        if self.pending.is_empty() && chunk.len() >= 2 {
            let nbytes = msg_size(chunk)? as usize;
            if chunk.len() - 2 == nbytes {
                return Ok(Feed::Complete(&chunk[2..]));
            }
        }

        if self.pending.len() + chunk.len() > self.limit + 2 {
            self.pending.clear();
            return Err(FrameError::Overflow);
        }
        self.pending.extend_from_slice(chunk);

        if self.pending.len() < 2 {
            return Ok(Feed::Pending(2 - self.pending.len()));
        }
        let nbytes = msg_size(&self.pending)? as usize;
        if nbytes > self.limit {
            self.pending.clear();
            return Err(FrameError::Overflow);
        }
        if self.pending.len() - 2 >= nbytes {
            let message = self.pending[2..2 + nbytes].to_vec();
            self.pending.clear();
            Ok(Feed::Assembled(message))
        } else {
            Ok(Feed::Pending(nbytes - (self.pending.len() - 2)))
        }
    }
}
