//! Line protocol parser.
//!
//! Lines are assembled one byte at a time so that assembly can stop and
//! resume at any readiness boundary without extra carry-over state.

/// Line terminator.
pub const TERMINATOR: u8 = b'\r';

/// Outcome of feeding one byte to a [`LineAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// Byte appended to the current line.
    Appended,
    /// Terminator received; the completed line is returned and the buffer reset.
    Complete(String),
    /// Unprintable byte dropped. `silent` is set for `\n`, which routinely
    /// follows the terminator and is not worth reporting.
    Discarded { byte: u8, silent: bool },
    /// The line had no room left; `dropped` bytes were discarded and the
    /// current byte now starts a new line.
    Overflow { dropped: usize },
}

/// Fixed-capacity line buffer.
///
/// Holds at most `capacity - 1` bytes, one slot being reserved for the
/// terminator position.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Box<[u8]>,
    len: usize,
}

impl LineAssembler {
    /// Create an assembler with the given buffer capacity.
    ///
    /// # Panics
    /// Panics if `capacity < 2`; configuration validation rejects such values.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "line capacity must leave room for one byte");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Feed one byte.
    pub fn push(&mut self, byte: u8) -> Push {
        if byte == TERMINATOR {
            let line = self.buf[..self.len].iter().map(|&b| b as char).collect();
            self.len = 0;
            Push::Complete(line)
        } else if !is_printable(byte) {
            Push::Discarded {
                byte,
                silent: byte == b'\n',
            }
        } else if self.len == self.max_line_len() {
            let dropped = self.len;
            self.buf[0] = byte;
            self.len = 1;
            Push::Overflow { dropped }
        } else {
            self.buf[self.len] = byte;
            self.len += 1;
            Push::Appended
        }
    }

    /// Discard any partially assembled line.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Bytes of the line assembled so far.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Longest line this assembler can hold.
    pub fn max_line_len(&self) -> usize {
        self.buf.len() - 1
    }
}

/// Printable ASCII, space included.
pub fn is_printable(byte: u8) -> bool {
    byte == b' ' || byte.is_ascii_graphic()
}

/// Bytes an acknowledgement adds around the line it echoes.
pub const ACK_OVERHEAD: usize = 13;

/// Format the acknowledgement sent back for a received line.
pub fn acknowledgement(line: &str) -> Vec<u8> {
    format!("Received \"{line}\"\r\n").into_bytes()
}

/// Frame a message pushed to the client by the owning process.
pub fn outbound_message(text: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(text.len() + 1);
    framed.extend_from_slice(text.as_bytes());
    framed.push(TERMINATOR);
    framed
}
