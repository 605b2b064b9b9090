//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then the server performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The loop runs on the calling thread only. `Poll::poll` is the single
//! blocking point; everything else happens in handlers dispatched from it.
//! SIGINT and SIGTERM arrive through the same poll instance and request a
//! stop.

use crate::config::Config;
use crate::runtime::readiness::Ready;
use crate::runtime::server::{
    LineServer, ServerError, ServerFailure, SessionOptions, StopReason,
};
use crate::runtime::token::SIGNAL_TOKEN;
use crate::telemetry::build_sink;
use mio::{Events, Interest, Poll};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Event loop failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed waiting for events: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to start server: {0}")]
    Start(#[from] ServerError),
    #[error("server stopped after an I/O error: {0}")]
    ServerFailed(#[source] ServerFailure),
}

/// Whether the loop keeps going after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Owns the poll instance and the server running on it.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    signals: Signals,
    config: Config,
    server: LineServer,
    restarts: u64,
    /// Written by the server's shutdown callback, read after each batch.
    stop_reason: Rc<Cell<Option<StopReason>>>,
}

impl EventLoop {
    /// Create the poll instance and start the server on it.
    pub fn new(config: Config) -> Result<Self, RunError> {
        let poll = Poll::new().map_err(RunError::Poll)?;
        let events = Events::with_capacity(config.events_capacity);

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(RunError::Signals)?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(RunError::Signals)?;

        let stop_reason = Rc::new(Cell::new(None));
        let server = start_server(&poll, &config, &stop_reason)?;

        Ok(Self {
            poll,
            events,
            signals,
            config,
            server,
            restarts: 0,
            stop_reason,
        })
    }

    /// Address the current server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Number of times the server was restarted after a client closed.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Run until the server stops for good.
    pub fn run(mut self) -> Result<(), RunError> {
        loop {
            if self.turn(None)? == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// Wait once, dispatch the batch, then act on a stop if one happened.
    ///
    /// A stop recorded before the call is acted on without waiting.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Flow, RunError> {
        if let Some(flow) = self.settle_stop()? {
            return Ok(flow);
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Flow::Continue);
            }
            return Err(RunError::Wait(e));
        }

        let mut signalled = false;
        for event in self.events.iter() {
            if event.token() == SIGNAL_TOKEN {
                signalled = true;
                continue;
            }
            self.server
                .handle_event(self.poll.registry(), event.token(), Ready::from(event));
        }
        if signalled {
            for signal in self.signals.pending() {
                info!(signal, "Termination signal received");
                self.server
                    .stop(self.poll.registry(), StopReason::Requested);
            }
        }

        Ok(self.settle_stop()?.unwrap_or(Flow::Continue))
    }

    /// Tear down a stopped server and apply the restart policy.
    ///
    /// Returns `None` when no stop is pending.
    fn settle_stop(&mut self) -> Result<Option<Flow>, RunError> {
        let Some(reason) = self.stop_reason.take() else {
            return Ok(None);
        };
        let failure = self.server.take_failure();
        self.server.close(self.poll.registry());

        match reason {
            StopReason::ClientClosed if self.config.restart_on_client_close => {
                self.server = start_server(&self.poll, &self.config, &self.stop_reason)?;
                self.restarts += 1;
                info!(restarts = self.restarts, "Client closed, listener restarted");
                Ok(Some(Flow::Continue))
            }
            StopReason::Error => {
                let failure = failure.unwrap_or_else(|| ServerFailure {
                    op: "unknown",
                    source: io::Error::other("no failure recorded"),
                });
                warn!(error = %failure, "Server stopped after an I/O error");
                Err(RunError::ServerFailed(failure))
            }
            StopReason::ClientClosed | StopReason::Requested => Ok(Some(Flow::Exit)),
        }
    }

    /// Ask the server to stop; the next turn exits.
    pub fn request_stop(&mut self) {
        self.server
            .stop(self.poll.registry(), StopReason::Requested);
    }
}

fn start_server(
    poll: &Poll,
    config: &Config,
    stop_reason: &Rc<Cell<Option<StopReason>>>,
) -> Result<LineServer, ServerError> {
    let slot = Rc::clone(stop_reason);
    LineServer::start(
        poll.registry(),
        config.address,
        config.port,
        config.backlog,
        SessionOptions::from(config),
        build_sink(config.telemetry_sink),
        Box::new(move |reason: StopReason| slot.set(Some(reason))),
    )
}
