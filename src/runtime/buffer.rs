//! Outbound buffer management.
//!
//! A session owns at most one `PendingOutput` at a time: it exists only
//! while a write is in flight and is dropped once fully flushed. Appends
//! while a write is in flight extend the same buffer, bounded by a fixed
//! ceiling so a stalled peer cannot grow memory without limit.

use bytes::BytesMut;
use thiserror::Error;

/// Error returned when an append would exceed the buffer ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pending output would exceed {limit} bytes")]
pub struct OutputFull {
    /// Configured ceiling in bytes.
    pub limit: usize,
}

/// Bytes queued for a client plus the count already sent.
///
/// `sent` never exceeds `data.len()`.
#[derive(Debug)]
pub struct PendingOutput {
    data: BytesMut,
    sent: usize,
    limit: usize,
}

impl PendingOutput {
    /// Create an empty buffer holding at most `limit` unsent bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            sent: 0,
            limit,
        }
    }

    /// Queue more bytes behind the unsent tail.
    ///
    /// Already-sent bytes are released first so the ceiling applies to
    /// unsent data only. On error the buffer is unchanged.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), OutputFull> {
        if self.remaining_len() + bytes.len() > self.limit {
            return Err(OutputFull { limit: self.limit });
        }
        if self.sent > 0 {
            let _ = self.data.split_to(self.sent);
            self.sent = 0;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Unsent bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.sent..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.sent
    }

    /// Record that `n` more bytes reached the socket.
    ///
    /// # Panics
    /// Panics (debug builds only) if `n` exceeds the unsent length.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining_len(), "advanced past end of output");
        self.sent = (self.sent + n).min(self.data.len());
    }

    /// Bytes sent since the last compaction.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Total bytes held, sent and unsent.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_drained(&self) -> bool {
        self.sent == self.data.len()
    }
}
