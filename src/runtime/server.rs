//! Single-client line server.
//!
//! `LineServer` owns one listening socket and at most one client session.
//! All of its state changes happen inside [`LineServer::handle_event`],
//! called by the owning event loop for each readiness event, or inside the
//! explicit operations the owner invokes between waits.
//!
//! A newly accepted connection always replaces the current client; the
//! replaced peer is closed without notice.

use crate::config::{Config, PeerClosePolicy};
use crate::protocols::line::{acknowledgement, outbound_message};
use crate::runtime::buffer::OutputFull;
use crate::runtime::connection::{ClientSession, ReadOutcome, WriteOutcome};
use crate::runtime::readiness::{Readiness, Ready};
use crate::runtime::token::EventSource;
use crate::telemetry::TelemetrySink;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The client closed its side of the connection.
    ClientClosed,
    /// An unrecoverable I/O error occurred.
    Error,
    /// The owner asked the server to stop.
    Requested,
}

/// Coarse server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for a client.
    Listening,
    /// A client is connected.
    ClientActive,
    /// Stopped or torn down. Absorbing.
    Terminated,
}

/// Server start and operation errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to open socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to set SO_REUSEADDR: {0}")]
    ReuseAddress(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to register listener: {0}")]
    Register(#[source] io::Error),
    #[error("no client connected")]
    NoClient,
    #[error("server has stopped")]
    Stopped,
    #[error(transparent)]
    OutputFull(#[from] OutputFull),
    #[error("send failed: {0}")]
    Io(#[source] io::Error),
}

/// The I/O failure that stopped a server with [`StopReason::Error`].
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct ServerFailure {
    /// Operation that failed.
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

/// Owner callback invoked once when the server stops.
pub type ShutdownCallback = Box<dyn FnOnce(StopReason)>;

/// Per-session settings taken from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub line_capacity: usize,
    pub echo: bool,
    pub peer_close: PeerClosePolicy,
    pub max_pending_output: usize,
    pub telemetry_tag: String,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            line_capacity: config.line_capacity,
            echo: config.echo,
            peer_close: config.peer_close,
            max_pending_output: config.max_pending_output,
            telemetry_tag: config.telemetry_tag.clone(),
        }
    }
}

/// One listening endpoint with at most one active client.
pub struct LineServer {
    listener: Option<TcpListener>,
    listener_registered: bool,
    local_addr: SocketAddr,
    client: Option<ClientSession<TcpStream>>,
    options: SessionOptions,
    sink: Box<dyn TelemetrySink>,
    on_shutdown: Option<ShutdownCallback>,
    stopped: bool,
    failure: Option<ServerFailure>,
}

impl LineServer {
    /// Bind, listen and register for connection readiness.
    ///
    /// On failure every descriptor opened so far is closed and no server is
    /// returned.
    pub fn start(
        registry: &Registry,
        address: Ipv4Addr,
        port: u16,
        backlog: i32,
        options: SessionOptions,
        sink: Box<dyn TelemetrySink>,
        on_shutdown: ShutdownCallback,
    ) -> Result<Self, ServerError> {
        let addr = SocketAddrV4::new(address, port);
        let mut listener = open_listener(addr, backlog).inspect_err(|e| {
            error!(error = %e, "TCP server failed to start");
        })?;

        registry
            .register(
                &mut listener,
                EventSource::Listener.token(),
                Interest::READABLE,
            )
            .map_err(ServerError::Register)
            .inspect_err(|e| {
                error!(error = %e, "TCP server failed to start");
            })?;

        let local_addr = listener.local_addr().unwrap_or(SocketAddr::V4(addr));
        info!(addr = %local_addr, backlog, "Listening for client connection");

        Ok(Self {
            listener: Some(listener),
            listener_registered: true,
            local_addr,
            client: None,
            options,
            sink,
            on_shutdown: Some(on_shutdown),
            stopped: false,
            failure: None,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the active client, if any.
    pub fn client_peer(&self) -> Option<SocketAddr> {
        self.client
            .as_ref()
            .and_then(|session| session.stream().peer_addr().ok())
    }

    pub fn state(&self) -> ServerState {
        if self.stopped || self.listener.is_none() {
            ServerState::Terminated
        } else if self.client.is_some() {
            ServerState::ClientActive
        } else {
            ServerState::Listening
        }
    }

    /// Dispatch one readiness event.
    ///
    /// Events for unknown tokens, events after the server stopped, and
    /// events for a readiness kind the client is not armed for are ignored.
    pub fn handle_event(&mut self, registry: &Registry, token: Token, ready: Ready) {
        if self.state() == ServerState::Terminated {
            return;
        }

        match EventSource::from_token(token) {
            Some(EventSource::Listener) => {
                if ready.readable {
                    self.accept_clients(registry);
                }
            }
            Some(EventSource::Client) => {
                if ready.readable && self.client_armed_for(Readiness::Read) {
                    self.on_client_readable(registry);
                }
                if ready.writable && self.client_armed_for(Readiness::Write) {
                    self.on_client_writable(registry);
                }
            }
            None => debug!(?token, "Ignoring event for unknown token"),
        }
    }

    /// Push a message to the active client, framed as `<text>\r`.
    ///
    /// Reading pauses until the message, and anything queued before it, is
    /// fully sent.
    pub fn send_message(&mut self, registry: &Registry, text: &str) -> Result<(), ServerError> {
        if self.state() == ServerState::Terminated {
            return Err(ServerError::Stopped);
        }
        let Some(session) = self.client.as_mut() else {
            warn!("No client connected, dropping outbound message");
            return Err(ServerError::NoClient);
        };

        match session.start_write(registry, &outbound_message(text))? {
            WriteOutcome::Flushed | WriteOutcome::Blocked => Ok(()),
            WriteOutcome::Failed(e) => {
                let returned = duplicate_error(&e);
                self.fail(registry, "send", e);
                Err(ServerError::Io(returned))
            }
        }
    }

    /// Stop serving: unregister the listener and the client, then notify
    /// the owner.
    ///
    /// Idempotent; the owner callback runs at most once. Descriptors stay
    /// open until [`LineServer::close`] or drop.
    pub fn stop(&mut self, registry: &Registry, reason: StopReason) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.listener_registered {
            if let Some(listener) = self.listener.as_mut() {
                if let Err(e) = registry.deregister(listener) {
                    debug!(error = %e, "Failed to deregister listener");
                }
            }
            self.listener_registered = false;
        }
        if let Some(session) = self.client.as_mut() {
            session.disarm(registry);
        }

        info!(?reason, "TCP server stopped");
        if let Some(callback) = self.on_shutdown.take() {
            callback(reason);
        }
    }

    /// Release every descriptor and buffer the server owns.
    ///
    /// Safe to call repeatedly and on a server that never stopped; does not
    /// invoke the owner callback.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut session) = self.client.take() {
            session.disarm(registry);
            debug!("Closed client connection");
        }
        if let Some(mut listener) = self.listener.take() {
            if self.listener_registered {
                if let Err(e) = registry.deregister(&mut listener) {
                    debug!(error = %e, "Failed to deregister listener");
                }
                self.listener_registered = false;
            }
            debug!(addr = %self.local_addr, "Closed listener");
        }
    }

    /// Take the failure recorded by the last error stop, if any.
    pub fn take_failure(&mut self) -> Option<ServerFailure> {
        self.failure.take()
    }

    /// Log a fatal I/O error, keep it for the owner, and stop.
    fn fail(&mut self, registry: &Registry, op: &'static str, e: io::Error) {
        report_error(op, &e);
        if self.failure.is_none() && !self.stopped {
            self.failure = Some(ServerFailure { op, source: e });
        }
        self.stop(registry, StopReason::Error);
    }

    fn client_armed_for(&self, readiness: Readiness) -> bool {
        self.client
            .as_ref()
            .is_some_and(|session| session.armed() == Some(readiness))
    }

    /// Accept every pending connection; the last one accepted wins.
    fn accept_clients(&mut self, registry: &Registry) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted client connection");
                    if let Some(previous_peer) = self.client_peer() {
                        info!(
                            previous = %previous_peer,
                            "New connection, unregistering previous client"
                        );
                    }
                    if let Some(mut previous) = self.client.take() {
                        previous.disarm(registry);
                    }

                    let mut session = ClientSession::new(
                        stream,
                        EventSource::Client.token(),
                        self.options.line_capacity,
                        self.options.max_pending_output,
                    );
                    if let Err(e) = session.start_line(registry) {
                        self.fail(registry, "register client", e);
                        return;
                    }
                    self.client = Some(session);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        code = e.raw_os_error().unwrap_or(0),
                        error = %e,
                        "Failed to accept connection"
                    );
                    return;
                }
            }
        }
    }

    fn on_client_readable(&mut self, registry: &Registry) {
        let Some(session) = self.client.as_mut() else {
            return;
        };

        match session.read_line(registry) {
            ReadOutcome::Line(line) => {
                info!(line = %line, "Received line");
                self.sink
                    .forward_line(&self.options.telemetry_tag, &line);
                self.answer_line(registry, &line);
            }
            ReadOutcome::Yielded => {}
            ReadOutcome::PeerClosed => {
                info!("Client has closed connection");
                match self.options.peer_close {
                    PeerClosePolicy::Stop => self.stop(registry, StopReason::ClientClosed),
                    PeerClosePolicy::Release => {
                        if let Some(mut session) = self.client.take() {
                            session.disarm(registry);
                        }
                        debug!("Released client, waiting for the next connection");
                    }
                }
            }
            ReadOutcome::Failed(e) => {
                self.fail(registry, "recv", e);
            }
        }
    }

    /// After a line was forwarded: echo it back or wait for the next one.
    fn answer_line(&mut self, registry: &Registry, line: &str) {
        let Some(session) = self.client.as_mut() else {
            return;
        };

        let result = if self.options.echo {
            match session.start_write(registry, &acknowledgement(line)) {
                Ok(WriteOutcome::Failed(e)) => Err(("send", e)),
                Ok(_) => Ok(()),
                Err(full) => {
                    warn!(error = %full, "Dropping acknowledgement");
                    session
                        .arm(registry, Readiness::Read)
                        .map_err(|e| ("register client", e))
                }
            }
        } else {
            session
                .arm(registry, Readiness::Read)
                .map_err(|e| ("register client", e))
        };

        if let Err((op, e)) = result {
            self.fail(registry, op, e);
        }
    }

    fn on_client_writable(&mut self, registry: &Registry) {
        let Some(session) = self.client.as_mut() else {
            return;
        };

        if let WriteOutcome::Failed(e) = session.drain(registry) {
            self.fail(registry, "send", e);
        }
    }
}

/// Open a non-blocking, close-on-exec IPv4 listener.
fn open_listener(addr: SocketAddrV4, backlog: i32) -> Result<TcpListener, ServerError> {
    // socket2 opens sockets close-on-exec.
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket
        .set_nonblocking(true)
        .map_err(ServerError::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(ServerError::ReuseAddress)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket.listen(backlog).map_err(ServerError::Listen)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Copy an error for a second owner, keeping the OS code when there is one.
fn duplicate_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

fn report_error(op: &str, e: &io::Error) {
    error!(
        op,
        code = e.raw_os_error().unwrap_or(0),
        error = %e,
        "TCP server I/O error"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::token::CLIENT_TOKEN;
    use mio::{Events, Poll};
    use std::cell::RefCell;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    type Lines = Rc<RefCell<Vec<(String, String)>>>;
    type Stops = Rc<RefCell<Vec<StopReason>>>;

    struct RecordingSink(Lines);

    impl TelemetrySink for RecordingSink {
        fn forward_line(&mut self, tag: &str, line: &str) {
            self.0.borrow_mut().push((tag.to_string(), line.to_string()));
        }
    }

    struct Harness {
        poll: Poll,
        events: Events,
        server: LineServer,
        lines: Lines,
        stops: Stops,
    }

    impl Harness {
        fn start(options: SessionOptions) -> Self {
            let poll = Poll::new().unwrap();
            let lines: Lines = Rc::default();
            let stops: Stops = Rc::default();
            let recorded = Rc::clone(&stops);
            let server = LineServer::start(
                poll.registry(),
                Ipv4Addr::LOCALHOST,
                0,
                1,
                options,
                Box::new(RecordingSink(Rc::clone(&lines))),
                Box::new(move |reason: StopReason| recorded.borrow_mut().push(reason)),
            )
            .unwrap();

            Self {
                poll,
                events: Events::with_capacity(16),
                server,
                lines,
                stops,
            }
        }

        fn connect(&self) -> StdTcpStream {
            let stream = StdTcpStream::connect(self.server.local_addr()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        /// Run the loop until `done` holds or five seconds pass.
        fn pump_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if done(self) {
                    return true;
                }
                self.pump_once(Duration::from_millis(20));
            }
            done(self)
        }

        fn pump_once(&mut self, timeout: Duration) {
            self.poll.poll(&mut self.events, Some(timeout)).unwrap();
            for event in self.events.iter() {
                self.server
                    .handle_event(self.poll.registry(), event.token(), Ready::from(event));
            }
        }

        fn lines(&self) -> Vec<String> {
            self.lines.borrow().iter().map(|(_, l)| l.clone()).collect()
        }
    }

    fn options(echo: bool) -> SessionOptions {
        SessionOptions {
            line_capacity: 32,
            echo,
            peer_close: PeerClosePolicy::Stop,
            max_pending_output: 256,
            telemetry_tag: "sendToCloud".to_string(),
        }
    }

    #[test]
    fn test_hello_with_echo() {
        let mut harness = Harness::start(options(true));
        let mut client = harness.connect();
        client.write_all(b"hello\r").unwrap();

        assert!(harness.pump_until(|h| !h.lines.borrow().is_empty()));
        assert_eq!(
            harness.lines.borrow()[0],
            ("sendToCloud".to_string(), "hello".to_string())
        );

        let expected = b"Received \"hello\"\r\n";
        let mut reply = vec![0u8; expected.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, expected);
        assert_eq!(harness.server.state(), ServerState::ClientActive);
    }

    #[test]
    fn test_lines_without_echo() {
        let mut harness = Harness::start(options(false));
        let mut client = harness.connect();
        client.write_all(b"first\r\nsec").unwrap();
        assert!(harness.pump_until(|h| h.lines().len() == 1));

        client.write_all(b"ond\r\n").unwrap();
        assert!(harness.pump_until(|h| h.lines().len() == 2));
        assert_eq!(harness.lines(), vec!["first", "second"]);

        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
            Ok(n) => panic!("unexpected {n} bytes from server"),
        }
    }

    #[test]
    fn test_newest_connection_wins() {
        let mut harness = Harness::start(options(false));
        let mut first = harness.connect();
        assert!(harness.pump_until(|h| h.server.client_peer().is_some()));
        let first_addr = first.local_addr().unwrap();
        assert_eq!(harness.server.client_peer(), Some(first_addr));

        let mut second = harness.connect();
        let second_addr = second.local_addr().unwrap();
        assert!(harness.pump_until(|h| h.server.client_peer() == Some(second_addr)));

        // The evicted client sees its connection closed.
        let mut buf = [0u8; 8];
        match first.read(&mut buf) {
            Ok(0) => {}
            Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
            Ok(n) => panic!("unexpected {n} bytes on evicted client"),
        }
        let _ = first.write_all(b"late\r");

        second.write_all(b"current\r").unwrap();
        assert!(harness.pump_until(|h| !h.lines().is_empty()));
        harness.pump_once(Duration::from_millis(50));
        assert_eq!(harness.lines(), vec!["current"]);
        assert!(harness.stops.borrow().is_empty());
    }

    #[test]
    fn test_peer_close_stops_server() {
        let mut harness = Harness::start(options(false));
        let client = harness.connect();
        assert!(harness.pump_until(|h| h.server.client_peer().is_some()));

        drop(client);
        assert!(harness.pump_until(|h| !h.stops.borrow().is_empty()));
        assert_eq!(*harness.stops.borrow(), vec![StopReason::ClientClosed]);
        assert_eq!(harness.server.state(), ServerState::Terminated);
    }

    #[test]
    fn test_peer_close_release_keeps_listening() {
        let mut harness = Harness::start(SessionOptions {
            peer_close: PeerClosePolicy::Release,
            ..options(false)
        });
        let client = harness.connect();
        assert!(harness.pump_until(|h| h.server.state() == ServerState::ClientActive));

        drop(client);
        assert!(harness.pump_until(|h| h.server.state() == ServerState::Listening));
        assert!(harness.stops.borrow().is_empty());

        let mut next = harness.connect();
        next.write_all(b"again\r").unwrap();
        assert!(harness.pump_until(|h| h.lines() == vec!["again"]));
    }

    #[test]
    fn test_overlong_line_restarts() {
        let mut harness = Harness::start(options(false));
        let mut client = harness.connect();

        // Capacity 32 holds 31 bytes; the 32nd printable byte restarts the line.
        let mut input = vec![b'x'; 31];
        input.extend_from_slice(b"tail\r");
        client.write_all(&input).unwrap();

        assert!(harness.pump_until(|h| !h.lines().is_empty()));
        assert_eq!(harness.lines(), vec!["tail"]);
    }

    #[test]
    fn test_send_message() {
        let mut harness = Harness::start(options(false));
        let result = harness
            .server
            .send_message(harness.poll.registry(), "nobody");
        assert!(matches!(result, Err(ServerError::NoClient)));

        let mut client = harness.connect();
        assert!(harness.pump_until(|h| h.server.client_peer().is_some()));

        harness
            .server
            .send_message(harness.poll.registry(), "status ok")
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"status ok\r");

        // Reading resumes after the push.
        client.write_all(b"ack\r").unwrap();
        assert!(harness.pump_until(|h| h.lines() == vec!["ack"]));
    }

    #[test]
    fn test_send_message_too_large() {
        let mut harness = Harness::start(options(false));
        let _client = harness.connect();
        assert!(harness.pump_until(|h| h.server.client_peer().is_some()));

        let text = "y".repeat(300);
        let result = harness.server.send_message(harness.poll.registry(), &text);
        assert!(matches!(result, Err(ServerError::OutputFull(_))));
        assert_eq!(harness.server.state(), ServerState::ClientActive);
    }

    #[test]
    fn test_stop_and_close_are_idempotent() {
        let mut harness = Harness::start(options(true));
        let _client = harness.connect();
        assert!(harness.pump_until(|h| h.server.client_peer().is_some()));

        let registry = harness.poll.registry();
        harness.server.stop(registry, StopReason::Requested);
        harness.server.stop(registry, StopReason::Error);
        assert_eq!(*harness.stops.borrow(), vec![StopReason::Requested]);
        assert_eq!(harness.server.state(), ServerState::Terminated);
        assert!(matches!(
            harness.server.send_message(registry, "late"),
            Err(ServerError::Stopped)
        ));

        harness.server.close(registry);
        harness.server.close(registry);
        assert!(harness.server.client_peer().is_none());
        assert_eq!(harness.stops.borrow().len(), 1);
    }

    #[test]
    fn test_close_without_stop() {
        let mut harness = Harness::start(options(true));
        let addr = harness.server.local_addr();
        let registry = harness.poll.registry();

        harness.server.close(registry);
        harness.server.close(registry);
        assert_eq!(harness.server.state(), ServerState::Terminated);
        assert!(harness.stops.borrow().is_empty());

        // The listening descriptor is gone.
        assert!(StdTcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_start_fails_on_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let poll = Poll::new().unwrap();

        let result = LineServer::start(
            poll.registry(),
            Ipv4Addr::LOCALHOST,
            port,
            1,
            options(true),
            Box::new(RecordingSink(Rc::default())),
            Box::new(|_: StopReason| panic!("callback must not run for a failed start")),
        );
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[test]
    fn test_unknown_token_ignored() {
        let mut harness = Harness::start(options(true));
        let registry = harness.poll.registry();
        harness
            .server
            .handle_event(registry, Token(42), Ready::READABLE);
        assert_eq!(harness.server.state(), ServerState::Listening);
    }

    #[test]
    fn test_stray_client_event_ignored_without_client() {
        let mut harness = Harness::start(options(true));
        let registry = harness.poll.registry();
        harness
            .server
            .handle_event(registry, CLIENT_TOKEN, Ready::WRITABLE);
        assert_eq!(harness.server.state(), ServerState::Listening);
        assert!(harness.stops.borrow().is_empty());
    }
}
