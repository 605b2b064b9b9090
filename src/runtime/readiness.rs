//! Readiness interests and the registration seam over the multiplexer.
//!
//! Sessions never talk to `mio::Registry` directly; they go through
//! [`Registrar`] so the arming discipline can be exercised against a
//! recording implementation in tests.

use mio::event::{Event, Source};
use mio::{Interest, Registry, Token};
use std::io;

/// The single readiness kind a client descriptor may be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Waiting for input.
    Read,
    /// Waiting for send buffer space.
    Write,
}

impl Readiness {
    /// mio interest for this readiness kind.
    pub fn interest(self) -> Interest {
        match self {
            Readiness::Read => Interest::READABLE,
            Readiness::Write => Interest::WRITABLE,
        }
    }
}

/// Register and unregister interests with the readiness multiplexer.
pub trait Registrar {
    fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized;

    fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized;
}

impl Registrar for Registry {
    fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        Registry::register(self, source, token, interest)
    }

    fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        Registry::deregister(self, source)
    }
}

/// Readiness flags carried by one dispatched event.
///
/// Closed and error conditions are folded into the matching direction so
/// the following read or write observes them as EOF or an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

#[cfg(test)]
impl Ready {
    pub const READABLE: Ready = Ready {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Ready = Ready {
        readable: false,
        writable: true,
    };
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Ready {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}
