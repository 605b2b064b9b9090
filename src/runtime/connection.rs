//! Client session state machine.
//!
//! A session owns the accepted socket, the line being assembled and any
//! output still waiting to be sent. It is armed for at most one readiness
//! kind at a time: read while waiting for the next line, write while output
//! is backed up. Switching kinds always deregisters first.

use crate::protocols::line::{LineAssembler, Push};
use crate::runtime::buffer::{OutputFull, PendingOutput};
use crate::runtime::readiness::{Readiness, Registrar};
use mio::event::Source;
use mio::Token;
use std::io::{self, Read, Write};
use tracing::{debug, trace};

/// Result of draining input after a read readiness event.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A line was completed. Reading is left disarmed; the caller decides
    /// whether to answer or re-arm.
    Line(String),
    /// No more input right now; read readiness is armed again.
    Yielded,
    /// The peer shut down its side of the connection.
    PeerClosed,
    /// Unrecoverable read or registration error.
    Failed(io::Error),
}

/// Result of pushing pending output to the socket.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Everything was sent and read readiness is armed for the next line.
    Flushed,
    /// Send buffer full; write readiness is armed.
    Blocked,
    /// Unrecoverable write or registration error. Pending output is dropped.
    Failed(io::Error),
}

/// One accepted client.
#[derive(Debug)]
pub struct ClientSession<S> {
    stream: S,
    token: Token,
    armed: Option<Readiness>,
    line: LineAssembler,
    pending: Option<PendingOutput>,
    max_pending_output: usize,
}

impl<S> ClientSession<S>
where
    S: Read + Write + Source,
{
    pub fn new(stream: S, token: Token, line_capacity: usize, max_pending_output: usize) -> Self {
        Self {
            stream,
            token,
            armed: None,
            line: LineAssembler::new(line_capacity),
            pending: None,
            max_pending_output,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Readiness kind currently registered, if any.
    pub fn armed(&self) -> Option<Readiness> {
        self.armed
    }

    /// Output still waiting to be sent.
    #[cfg(test)]
    pub fn pending_output(&self) -> Option<&PendingOutput> {
        self.pending.as_ref()
    }

    /// Bytes of the partially assembled line.
    #[cfg(test)]
    pub fn partial_line(&self) -> &[u8] {
        self.line.pending()
    }

    /// Register for `readiness`, replacing any other registration.
    ///
    /// Re-arming the kind already armed is a no-op.
    pub fn arm<R: Registrar>(&mut self, registrar: &R, readiness: Readiness) -> io::Result<()> {
        if self.armed == Some(readiness) {
            return Ok(());
        }
        self.disarm(registrar);
        registrar.register(&mut self.stream, self.token, readiness.interest())?;
        self.armed = Some(readiness);
        trace!(?readiness, "Client armed");
        Ok(())
    }

    /// Drop whatever registration the session holds.
    pub fn disarm<R: Registrar>(&mut self, registrar: &R) {
        if let Some(readiness) = self.armed.take() {
            if let Err(e) = registrar.deregister(&mut self.stream) {
                debug!(?readiness, error = %e, "Failed to deregister client");
            }
        }
    }

    /// Begin a fresh line and wait for input.
    pub fn start_line<R: Registrar>(&mut self, registrar: &R) -> io::Result<()> {
        self.line.reset();
        self.arm(registrar, Readiness::Read)
    }

    /// Consume input one byte at a time until a line completes, input runs
    /// dry, or the connection ends.
    ///
    /// A partial line survives a yield and continues on the next event.
    pub fn read_line<R: Registrar>(&mut self, registrar: &R) -> ReadOutcome {
        self.disarm(registrar);

        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return ReadOutcome::PeerClosed,
                Ok(_) => match self.line.push(byte[0]) {
                    Push::Complete(line) => return ReadOutcome::Line(line),
                    Push::Appended => {}
                    Push::Discarded { silent: true, .. } => {}
                    Push::Discarded { byte, .. } => {
                        debug!("Discarding unprintable character 0x{:02x}", byte);
                    }
                    Push::Overflow { dropped } => {
                        debug!(dropped, "Input data overflow, discarding line");
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return match self.arm(registrar, Readiness::Read) {
                        Ok(()) => ReadOutcome::Yielded,
                        Err(e) => ReadOutcome::Failed(e),
                    };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    /// Queue `bytes` behind any pending output and start sending.
    ///
    /// Fails without touching the socket if the pending output ceiling
    /// would be exceeded.
    pub fn start_write<R: Registrar>(
        &mut self,
        registrar: &R,
        bytes: &[u8],
    ) -> Result<WriteOutcome, OutputFull> {
        let limit = self.max_pending_output;
        let pending = self.pending.get_or_insert_with(|| PendingOutput::new(limit));
        if let Err(e) = pending.append(bytes) {
            if pending.is_drained() {
                self.pending = None;
            }
            return Err(e);
        }
        Ok(self.drain(registrar))
    }

    /// Send as much pending output as the socket accepts.
    ///
    /// Once everything is sent the buffer is released and the session goes
    /// back to waiting for the next line.
    pub fn drain<R: Registrar>(&mut self, registrar: &R) -> WriteOutcome {
        self.disarm(registrar);

        if let Some(pending) = self.pending.as_mut() {
            while !pending.is_drained() {
                match self.stream.write(pending.remaining()) {
                    Ok(0) => {
                        self.pending = None;
                        return WriteOutcome::Failed(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ));
                    }
                    Ok(n) => pending.advance(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        trace!(
                            sent = pending.sent(),
                            remaining = pending.remaining_len(),
                            "Client send buffer full"
                        );
                        return match self.arm(registrar, Readiness::Write) {
                            Ok(()) => WriteOutcome::Blocked,
                            Err(e) => {
                                self.pending = None;
                                WriteOutcome::Failed(e)
                            }
                        };
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.pending = None;
                        return WriteOutcome::Failed(e);
                    }
                }
            }
        }

        self.pending = None;
        match self.arm(registrar, Readiness::Read) {
            Ok(()) => WriteOutcome::Flushed,
            Err(e) => WriteOutcome::Failed(e),
        }
    }

    #[cfg(test)]
    fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}
