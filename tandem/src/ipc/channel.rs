//! Duplex record channel between the control process and the service.
//!
//! A [`Channel`] has a fixed [`Role`]. The server binds the endpoint name and
//! serves one peer at a time; the client connects to it. Connection setup is
//! implicit: every blocking call first makes sure the transport exists, and a
//! socket whose peer went away is dropped and recreated from scratch.
//!
//! # Connection States
//!
//! ```text
//!                 bind / connect in progress
//! Disconnected ──────────────────────────────► Connecting
//!      ▲   │                                        │
//!      │   │ connect completed at once (client)     │ peer accepted /
//!      │   ▼                                        │ connect completed
//!      │ Connected ◄────────────────────────────────┘
//!      │   │
//!      └───┘ peer gone / reset_connection
//! ```
//!
//! # Pending I/O
//!
//! At most one read and one write are outstanding. A write that cannot
//! complete immediately stays pending until the socket becomes writable or
//! its timeout expires; a second write while one is pending is rejected with
//! [`ChannelError::WriteInProgress`] and the record is dropped.
//!
//! All readiness comes from one edge-triggered [`mio::Poll`], so readiness
//! observed while waiting for one thing (say, writability) is remembered in
//! flags and reported by the next call that cares about it.

use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use super::endpoint::EndpointName;
use super::socket::{SeqPacketListener, SeqPacketSocket};
use crate::config::ChannelConfig;
use crate::context::RuntimeContext;
use crate::runtime::queue::WakeSignal;
use crate::runtime::timing::{Timeout, remaining};
use crate::trace::{debug, info, trace, warn};
use crate::wire::{RECORD_SIZE, WireMessage};

const LISTENER: Token = Token(0);
const PEER: Token = Token(1);
const CANCEL: Token = Token(2);

const LISTEN_BACKLOG: i32 = 4;
const EVENTS_CAPACITY: usize = 8;
/// Large enough that an oversized message shows up as the wrong size.
const RECV_BUF_SIZE: usize = 64;

/// Which end of the channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the endpoint name and accepts one peer.
    Server,
    /// Connects to the server's endpoint.
    Client,
}

/// Connection state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The endpoint could not be created or opened.
    #[error("endpoint {name} unavailable")]
    TransportUnavailable {
        name: String,
        #[source]
        source: Option<io::Error>,
    },
    /// The peer closed or reset the connection.
    #[error("peer went away")]
    PeerGone,
    /// No peer is connected.
    #[error("not connected")]
    NotConnected,
    /// The operation did not complete in time.
    #[error("timed out")]
    Timeout,
    /// Another write is still pending.
    #[error("a write is already in progress")]
    WriteInProgress,
    /// The owner's cancel signal fired.
    #[error("cancelled")]
    Cancelled,
    /// Unexpected OS failure.
    #[error("{op} failed")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ChannelError {
    /// Whether this error means the connection is gone.
    #[must_use]
    pub const fn is_peer_gone(&self) -> bool {
        matches!(self, Self::PeerGone)
    }

    fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
    )
}

/// Readiness collected from one poll.
#[derive(Default)]
struct Readiness {
    accept: bool,
    readable: bool,
    hangup: bool,
    writable: bool,
    cancel: bool,
}

/// Message-framed duplex channel.
pub struct Channel {
    role: Role,
    name: EndpointName,
    config: ChannelConfig,
    poll: Poll,
    events: Events,
    listener: Option<SeqPacketListener>,
    peer: Option<SeqPacketSocket>,
    state: ConnectionState,
    cancel: Option<Arc<WakeSignal>>,
    /// Earliest time the transport may be created again after a failure.
    next_attempt: Option<Instant>,
    accept_ready: bool,
    read_ready: bool,
    read_pending: bool,
    peer_hangup: bool,
    pending_write: Option<[u8; RECORD_SIZE]>,
    /// Cancel signal pulsed without cancellation while a blocking call
    /// consumed it; the next `wait` returns at once.
    wake_pending: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("read_pending", &self.read_pending)
            .field("write_pending", &self.pending_write.is_some())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates a channel. No socket is touched until the first blocking call.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the poll instance cannot be created.
    pub fn new(
        role: Role,
        name: EndpointName,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let poll = Poll::new().map_err(|e| ChannelError::io("epoll_create", e))?;
        Ok(Self {
            role,
            name,
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: None,
            peer: None,
            state: ConnectionState::Disconnected,
            cancel: None,
            next_attempt: None,
            accept_ready: false,
            read_ready: false,
            read_pending: false,
            peer_hangup: false,
            pending_write: None,
            wake_pending: false,
        })
    }

    /// Server end for `name`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn server(name: EndpointName, config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::new(Role::Server, name, config)
    }

    /// Client end for `name`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn client(name: EndpointName, config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::new(Role::Client, name, config)
    }

    /// Channel for the role and endpoint recorded in `ctx`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn from_context(ctx: &RuntimeContext) -> Result<Self, ChannelError> {
        Self::new(ctx.role(), ctx.endpoint().clone(), ctx.config().channel.clone())
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn name(&self) -> &EndpointName {
        &self.name
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    #[must_use]
    pub const fn is_write_pending(&self) -> bool {
        self.pending_write.is_some()
    }

    #[must_use]
    pub const fn is_read_pending(&self) -> bool {
        self.read_pending && !self.read_ready
    }

    /// Registers the owner's wake signal.
    ///
    /// Blocking connect and write waits abort with
    /// [`ChannelError::Cancelled`] once the signal is cancelled. A plain
    /// pulse observed during such a wait makes the next [`wait`](Self::wait)
    /// return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the signal cannot be registered.
    pub fn set_cancel_event(&mut self, signal: Arc<WakeSignal>) -> Result<(), ChannelError> {
        let registry = self.poll.registry();
        if let Some(old) = self.cancel.take() {
            let _ = registry.deregister(&mut SourceFd(&old.as_raw_fd()));
        }
        registry
            .register(&mut SourceFd(&signal.as_raw_fd()), CANCEL, Interest::READABLE)
            .map_err(|e| ChannelError::io("register cancel event", e))?;
        self.cancel = Some(signal);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(endpoint = %self.name, from = ?self.state, to = ?state, "connection state");
            self.state = state;
        }
    }

    fn unavailable(&self, source: Option<io::Error>) -> ChannelError {
        ChannelError::TransportUnavailable {
            name: self.name.to_string(),
            source,
        }
    }

    fn in_backoff(&self) -> bool {
        self.next_attempt.is_some_and(|at| Instant::now() < at)
    }

    fn back_off(&mut self) {
        self.next_attempt = Some(Instant::now() + self.config.retry_interval());
    }

    /// Creates the transport if it does not exist yet.
    ///
    /// The server binds and listens, then accepts a waiting peer if one is
    /// queued. The client connects. After a failure no new attempt is made
    /// for the configured retry interval.
    ///
    /// # Errors
    ///
    /// [`ChannelError::TransportUnavailable`] if the endpoint cannot be
    /// created or opened (or the retry interval has not elapsed), or
    /// [`ChannelError::Io`] on registration failure.
    pub fn ensure_transport(&mut self) -> Result<(), ChannelError> {
        match self.role {
            Role::Server => self.ensure_listener(),
            Role::Client => self.ensure_connected_client(),
        }
    }

    fn ensure_listener(&mut self) -> Result<(), ChannelError> {
        if self.listener.is_none() {
            if self.in_backoff() {
                return Err(self.unavailable(None));
            }
            let mut listener = match SeqPacketListener::bind(&self.name, LISTEN_BACKLOG) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(endpoint = %self.name, error = %e, "cannot create endpoint");
                    self.back_off();
                    return Err(self.unavailable(Some(e)));
                }
            };
            self.poll
                .registry()
                .register(&mut listener, LISTENER, Interest::READABLE)
                .map_err(|e| ChannelError::io("register listener", e))?;
            info!(endpoint = %self.name, "listening");
            self.listener = Some(listener);
            self.next_attempt = None;
            self.accept_ready = true;
        }

        if self.peer.is_none() {
            self.set_state(ConnectionState::Connecting);
        }
        if self.accept_ready {
            self.accept_pending()?;
        }
        Ok(())
    }

    fn accept_pending(&mut self) -> Result<(), ChannelError> {
        self.accept_ready = false;
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };
            let mut sock = match listener.try_accept() {
                Ok(Some(sock)) => sock,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(endpoint = %self.name, error = %e, "accept failed");
                    return Ok(());
                }
            };

            let cred = sock.peer_credentials();
            if self.peer.is_some() {
                warn!(endpoint = %self.name, peer = ?cred.ok(), "rejecting second peer");
                let _ = sock.shutdown();
                continue;
            }

            self.poll
                .registry()
                .register(&mut sock, PEER, Interest::READABLE | Interest::WRITABLE)
                .map_err(|e| ChannelError::io("register peer", e))?;
            match cred {
                Ok(cred) => info!(
                    endpoint = %self.name,
                    pid = ?cred.pid,
                    uid = cred.uid.as_raw(),
                    "peer connected"
                ),
                Err(e) => info!(endpoint = %self.name, error = %e, "peer connected"),
            }
            self.peer = Some(sock);
            self.read_ready = true;
            self.set_state(ConnectionState::Connected);
        }
    }

    fn ensure_connected_client(&mut self) -> Result<(), ChannelError> {
        if self.peer.is_some() {
            return Ok(());
        }
        if self.in_backoff() {
            return Err(self.unavailable(None));
        }

        match SeqPacketSocket::connect(&self.name) {
            Ok(mut sock) => {
                self.poll
                    .registry()
                    .register(&mut sock, PEER, Interest::READABLE | Interest::WRITABLE)
                    .map_err(|e| ChannelError::io("register peer", e))?;
                info!(endpoint = %self.name, "connected");
                self.peer = Some(sock);
                self.next_attempt = None;
                self.read_ready = true;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                // A full backlog means the server exists but is busy.
                if e.kind() == ErrorKind::WouldBlock {
                    self.set_state(ConnectionState::Connecting);
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
                debug!(endpoint = %self.name, error = %e, "connect failed");
                self.back_off();
                Err(self.unavailable(Some(e)))
            }
        }
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ChannelError::io("epoll_wait", e)),
        }

        let mut ready = Readiness::default();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => ready.accept = true,
                PEER => {
                    ready.readable |= event.is_readable();
                    ready.writable |= event.is_writable();
                    ready.hangup |= event.is_read_closed() || event.is_error();
                }
                CANCEL => ready.cancel = true,
                _ => {}
            }
        }

        self.accept_ready |= ready.accept;
        if self.peer.is_some() {
            self.read_ready |= ready.readable;
            self.peer_hangup |= ready.hangup;
        }
        if ready.writable {
            trace!(endpoint = %self.name, "peer writable");
        }
        if ready.cancel {
            if let Some(signal) = &self.cancel {
                signal.reset();
            }
            self.wake_pending = true;
        }
        Ok(())
    }

    /// Blocks until there may be something to read, a peer was accepted, the
    /// cancel signal fired or `timeout` elapsed.
    ///
    /// Returns `Ok(false)` if the peer went away; the channel is then
    /// [`Disconnected`](ConnectionState::Disconnected).
    ///
    /// # Errors
    ///
    /// [`ChannelError::Io`] for unexpected OS failures.
    pub fn wait(&mut self, timeout: impl Into<Timeout>) -> Result<bool, ChannelError> {
        let now = Instant::now();
        let mut deadline = timeout.into().deadline_from(now);

        match self.ensure_transport() {
            Ok(()) => {}
            Err(ChannelError::TransportUnavailable { .. }) => {
                // Sleep no longer than the back-off so the next attempt is timely.
                if let Some(at) = self.next_attempt {
                    deadline = Some(deadline.map_or(at, |dl| dl.min(at)));
                }
            }
            Err(e) => return Err(e),
        }

        let was_connected = self.is_connected();
        loop {
            if self.wake_pending {
                self.wake_pending = false;
                return Ok(true);
            }
            if self.peer_hangup {
                return Ok(self.check_hangup());
            }
            if self.read_ready && self.peer.is_some() {
                return Ok(true);
            }
            if self.accept_ready && self.role == Role::Server {
                self.accept_pending()?;
                if self.is_connected() != was_connected {
                    return Ok(true);
                }
            }

            let left = remaining(deadline, Instant::now());
            if left == Some(Duration::ZERO) {
                return Ok(true);
            }
            self.poll_once(left)?;
        }
    }

    /// Hung-up peer: keep going while it still has queued records.
    fn check_hangup(&mut self) -> bool {
        let queued = self
            .peer
            .as_ref()
            .and_then(|peer| peer.pending_bytes().ok())
            .unwrap_or(0);
        if queued > 0 {
            self.read_ready = true;
            return true;
        }
        debug!(endpoint = %self.name, "peer hung up");
        self.drop_peer();
        false
    }

    /// Returns the next complete record, if one is queued right now.
    ///
    /// Malformed records are logged and skipped. End of stream marks the
    /// peer gone.
    pub fn read(&mut self) -> Option<WireMessage> {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let result = self.peer.as_ref()?.try_recv(&mut buf);
            match result {
                Ok(Some(0)) => {
                    debug!(endpoint = %self.name, "end of stream");
                    self.drop_peer();
                    return None;
                }
                Ok(Some(n)) => {
                    self.read_pending = false;
                    match WireMessage::decode(&buf[..n]) {
                        Ok(msg) => return Some(msg),
                        Err(e) => {
                            trace!(endpoint = %self.name, error = %e, "dropping malformed record");
                        }
                    }
                }
                Ok(None) => {
                    self.read_ready = false;
                    self.read_pending = true;
                    return None;
                }
                Err(e) => {
                    let _ = self.classify("recv", e);
                    return None;
                }
            }
        }
    }

    /// Arms a read so the next [`wait`](Self::wait) reports when it completes.
    ///
    /// # Errors
    ///
    /// [`ChannelError::NotConnected`] without a peer.
    pub fn start_async_read(&mut self) -> Result<(), ChannelError> {
        if self.peer.is_none() {
            return Err(ChannelError::NotConnected);
        }
        self.read_pending = true;
        Ok(())
    }

    /// Abandons the armed read.
    pub fn cancel_read(&mut self) {
        self.read_pending = false;
    }

    /// Starts writing `msg`.
    ///
    /// Returns `Ok(true)` if the record was sent at once and `Ok(false)` if
    /// it is pending; complete it with [`finish_write`](Self::finish_write).
    ///
    /// # Errors
    ///
    /// [`ChannelError::WriteInProgress`] if a write is already pending,
    /// [`ChannelError::NotConnected`] without a peer,
    /// [`ChannelError::PeerGone`] or [`ChannelError::Io`] if sending fails.
    pub fn begin_write(&mut self, msg: &WireMessage) -> Result<bool, ChannelError> {
        if self.pending_write.is_some() {
            return Err(ChannelError::WriteInProgress);
        }
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let bytes = msg.encode();
        let Some(peer) = self.peer.as_ref() else {
            return Err(ChannelError::NotConnected);
        };
        match peer.try_send(&bytes) {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                trace!(endpoint = %self.name, event = %msg.event, "write pending");
                self.pending_write = Some(bytes);
                Ok(false)
            }
            Err(e) => Err(self.classify("send", e)),
        }
    }

    /// Waits up to `timeout` for the pending write to complete.
    ///
    /// On timeout or cancellation the pending record is discarded.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Timeout`], [`ChannelError::Cancelled`],
    /// [`ChannelError::PeerGone`] or [`ChannelError::Io`].
    pub fn finish_write(&mut self, timeout: impl Into<Timeout>) -> Result<(), ChannelError> {
        let deadline = timeout.into().deadline_from(Instant::now());
        loop {
            let Some(bytes) = self.pending_write else {
                return Ok(());
            };
            let Some(peer) = self.peer.as_ref() else {
                self.pending_write = None;
                return Err(ChannelError::PeerGone);
            };
            match peer.try_send(&bytes) {
                Ok(Some(_)) => {
                    self.pending_write = None;
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => {
                    self.pending_write = None;
                    return Err(self.classify("send", e));
                }
            }

            if self.is_cancelled() {
                self.cancel_write();
                return Err(ChannelError::Cancelled);
            }
            let left = remaining(deadline, Instant::now());
            if left == Some(Duration::ZERO) {
                debug!(endpoint = %self.name, "write timed out");
                self.cancel_write();
                return Err(ChannelError::Timeout);
            }
            self.poll_once(left)?;
        }
    }

    /// Discards the pending write, if any.
    pub fn cancel_write(&mut self) {
        self.pending_write = None;
    }

    /// Sends `msg`, connecting first if needed, and blocks up to `timeout`.
    ///
    /// The server waits for a peer for at most the configured connect
    /// timeout. A record that cannot be sent in time is dropped.
    ///
    /// # Errors
    ///
    /// [`ChannelError::WriteInProgress`] immediately if a write is pending,
    /// otherwise any error of [`ensure_transport`](Self::ensure_transport),
    /// [`begin_write`](Self::begin_write) or [`finish_write`](Self::finish_write).
    pub fn write(
        &mut self,
        msg: &WireMessage,
        timeout: impl Into<Timeout>,
    ) -> Result<(), ChannelError> {
        if self.pending_write.is_some() {
            return Err(ChannelError::WriteInProgress);
        }
        let deadline = timeout.into().deadline_from(Instant::now());
        self.wait_connected(deadline)?;
        if self.begin_write(msg)? {
            return Ok(());
        }
        self.finish_write(Timeout::from(remaining(deadline, Instant::now())))
    }

    fn wait_connected(&mut self, deadline: Option<Instant>) -> Result<(), ChannelError> {
        let connect_deadline = Instant::now() + self.config.connect_timeout();
        let deadline = deadline.map_or(connect_deadline, |dl| dl.min(connect_deadline));
        loop {
            self.ensure_transport()?;
            if self.is_connected() {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            let left = remaining(Some(deadline), Instant::now());
            if left == Some(Duration::ZERO) {
                return Err(ChannelError::Timeout);
            }
            self.poll_once(left)?;
        }
    }

    /// Drops the current peer and clears pending I/O. The server shuts the
    /// peer down first; its listener stays bound.
    pub fn reset_connection(&mut self) {
        if self.role == Role::Server {
            if let Some(peer) = &self.peer {
                let _ = peer.shutdown();
            }
        }
        self.drop_peer();
    }

    fn classify(&mut self, op: &'static str, err: io::Error) -> ChannelError {
        if is_peer_gone(&err) {
            debug!(endpoint = %self.name, op, error = %err, "peer gone");
            self.drop_peer();
            ChannelError::PeerGone
        } else {
            warn!(
                endpoint = %self.name,
                op,
                errno = err.raw_os_error(),
                error = %err,
                "channel I/O failed"
            );
            ChannelError::io(op, err)
        }
    }

    fn drop_peer(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            let _ = self.poll.registry().deregister(&mut peer);
        }
        self.read_ready = false;
        self.read_pending = false;
        self.peer_hangup = false;
        self.pending_write = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel_read();
        self.cancel_write();
        self.reset_connection();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        if let Some(signal) = self.cancel.take() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&signal.as_raw_fd()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::event::Event;

    fn unique_name() -> EndpointName {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        EndpointName::new(format!("tandem.channel.{}.{n}", std::process::id())).unwrap()
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            connect_timeout_ms: 500,
            retry_interval_ms: 50,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Connected server/client pair with all initial readiness consumed.
    fn pair() -> (Channel, Channel) {
        let name = unique_name();
        let mut server = Channel::server(name.clone(), config()).unwrap();
        server.ensure_transport().unwrap();
        let mut client = Channel::client(name, config()).unwrap();
        client.ensure_transport().unwrap();
        assert!(server.wait(ms(500)).unwrap());
        assert!(server.is_connected());
        assert!(server.read().is_none());
        assert!(client.read().is_none());
        (server, client)
    }

    #[test]
    fn server_goes_through_connecting() {
        let mut server = Channel::server(unique_name(), config()).unwrap();
        assert!(server.is_disconnected());
        server.ensure_transport().unwrap();
        assert_eq!(server.state(), ConnectionState::Connecting);
    }

    #[test]
    fn client_connects_directly() {
        let name = unique_name();
        let mut server = Channel::server(name.clone(), config()).unwrap();
        server.ensure_transport().unwrap();

        let mut client = Channel::client(name, config()).unwrap();
        assert!(client.is_disconnected());
        client.ensure_transport().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn client_without_server_backs_off() {
        let mut client = Channel::client(unique_name(), config()).unwrap();
        let err = client.ensure_transport().unwrap_err();
        assert!(matches!(err, ChannelError::TransportUnavailable { source: Some(_), .. }));
        assert!(client.is_disconnected());

        // Inside the retry interval no new attempt is made.
        let err = client.ensure_transport().unwrap_err();
        assert!(matches!(err, ChannelError::TransportUnavailable { source: None, .. }));

        // wait() sleeps at most until the next attempt is allowed.
        let start = Instant::now();
        assert!(client.wait(ms(5000)).unwrap());
        assert!(start.elapsed() < ms(1000));
    }

    #[test]
    fn records_flow_both_ways() {
        let (mut server, mut client) = pair();

        client.write(&WireMessage::now(Event::ServiceReady), ms(500)).unwrap();
        assert!(server.wait(ms(500)).unwrap());
        assert_eq!(server.read().map(|m| m.event), Some(Event::ServiceReady));

        server.write(&WireMessage::now(Event::LauncherStarted), ms(500)).unwrap();
        assert!(client.wait(ms(500)).unwrap());
        assert_eq!(client.read().map(|m| m.event), Some(Event::LauncherStarted));
    }

    #[test]
    fn malformed_records_are_skipped() {
        let name = unique_name();
        let mut server = Channel::server(name.clone(), config()).unwrap();
        server.ensure_transport().unwrap();
        let raw = SeqPacketSocket::connect(&name).unwrap();
        assert!(server.wait(ms(500)).unwrap());

        raw.send(&[1, 2, 3]).unwrap();
        let mut unknown = WireMessage::now(Event::Heartbeat).encode();
        unknown[..4].copy_from_slice(&77u32.to_le_bytes());
        raw.send(&unknown).unwrap();
        raw.send(&[0u8; 40]).unwrap();
        raw.send(&WireMessage::now(Event::ConfigChanged).encode()).unwrap();

        assert!(server.wait(ms(500)).unwrap());
        assert_eq!(server.read().map(|m| m.event), Some(Event::ConfigChanged));
        assert!(server.read().is_none());
        assert!(server.is_connected());
    }

    /// Writes until the socket buffer is full and a write is left pending.
    fn fill_until_pending(client: &mut Channel) {
        if let Some(peer) = &client.peer {
            peer.set_send_buffer_size(4096).unwrap();
        }
        let msg = WireMessage::now(Event::Heartbeat);
        for _ in 0..1_000_000 {
            if !client.begin_write(&msg).unwrap() {
                return;
            }
        }
        panic!("send buffer never filled");
    }

    #[test]
    fn second_write_is_rejected_while_pending() {
        let (mut server, mut client) = pair();
        fill_until_pending(&mut client);
        assert!(client.is_write_pending());

        let start = Instant::now();
        let err = client.begin_write(&WireMessage::now(Event::ShowControl)).unwrap_err();
        assert!(matches!(err, ChannelError::WriteInProgress));
        let err = client.write(&WireMessage::now(Event::ShowControl), ms(5000)).unwrap_err();
        assert!(matches!(err, ChannelError::WriteInProgress));
        assert!(start.elapsed() < ms(100));
        assert!(client.is_write_pending(), "in-flight write must survive");

        // Drain the server; the pending record then goes through.
        let drainer = std::thread::spawn(move || {
            let stop = Instant::now() + ms(2000);
            let mut n = 0usize;
            while Instant::now() < stop {
                let _ = server.wait(ms(20));
                while server.read().is_some() {
                    n += 1;
                }
            }
            n
        });
        client.finish_write(ms(2000)).unwrap();
        assert!(!client.is_write_pending());
        assert!(drainer.join().unwrap() > 0);
    }

    #[test]
    fn pending_write_times_out_and_is_dropped() {
        let (_server, mut client) = pair();
        fill_until_pending(&mut client);
        let err = client.finish_write(ms(50)).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout));
        assert!(!client.is_write_pending());
        assert!(client.is_connected());
    }

    #[test]
    fn dropped_peer_makes_wait_return_false() {
        let (mut server, client) = pair();
        drop(client);

        let start = Instant::now();
        assert!(!server.wait(config().connect_timeout()).unwrap());
        assert!(server.is_disconnected());
        assert!(start.elapsed() < config().connect_timeout());

        // The listener survives; a new client is accepted.
        let mut again = Channel::client(server.name().clone(), config()).unwrap();
        again.ensure_transport().unwrap();
        assert!(server.wait(ms(500)).unwrap());
        assert!(server.is_connected());
    }

    #[test]
    fn queued_records_are_read_before_hangup() {
        let (mut server, mut client) = pair();
        client.write(&WireMessage::now(Event::LauncherExited), ms(500)).unwrap();
        drop(client);

        assert!(server.wait(ms(500)).unwrap());
        assert_eq!(server.read().map(|m| m.event), Some(Event::LauncherExited));
        // Either the read above already saw end of stream, or the next wait does.
        if server.is_connected() {
            assert!(!server.wait(ms(500)).unwrap());
        }
        assert!(server.is_disconnected());
    }

    #[test]
    fn reset_connection_shuts_peer_down() {
        let (mut server, mut client) = pair();
        server.reset_connection();
        assert!(server.is_disconnected());
        assert!(!client.wait(ms(500)).unwrap());
        assert!(client.is_disconnected());
    }

    #[test]
    fn write_without_peer_times_out() {
        let mut server = Channel::server(unique_name(), config()).unwrap();
        let start = Instant::now();
        let err = server.write(&WireMessage::now(Event::Heartbeat), ms(100)).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(100) && elapsed < ms(400));
    }

    #[test]
    fn cancel_aborts_blocking_write() {
        let mut server = Channel::server(unique_name(), config()).unwrap();
        let wake = Arc::new(WakeSignal::new().unwrap());
        server.set_cancel_event(Arc::clone(&wake)).unwrap();

        let canceller = {
            let wake = Arc::clone(&wake);
            std::thread::spawn(move || {
                std::thread::sleep(ms(30));
                wake.cancel();
            })
        };
        let start = Instant::now();
        let err = server.write(&WireMessage::now(Event::Heartbeat), ms(5000)).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, ChannelError::Cancelled));
        assert!(start.elapsed() < ms(400));
    }

    #[test]
    fn pulse_during_blocking_call_is_remembered() {
        let (_server, mut client) = pair();
        let wake = Arc::new(WakeSignal::new().unwrap());
        client.set_cancel_event(Arc::clone(&wake)).unwrap();

        wake.pulse();
        fill_until_pending(&mut client);
        let _ = client.finish_write(ms(20));

        let start = Instant::now();
        assert!(client.wait(ms(5000)).unwrap());
        assert!(start.elapsed() < ms(1000));
    }

    #[test]
    fn second_peer_is_turned_away() {
        let (mut server, _client) = pair();
        let extra = SeqPacketSocket::connect(server.name()).unwrap();
        let _ = server.wait(ms(100));
        assert!(server.is_connected());

        let mut buf = [0u8; 16];
        let stop = Instant::now() + ms(1000);
        loop {
            match extra.try_recv(&mut buf) {
                Ok(Some(0)) => break,
                Ok(_) if Instant::now() < stop => std::thread::sleep(ms(5)),
                other => panic!("extra peer not closed: {other:?}"),
            }
        }
    }

    #[test]
    fn async_read_bookkeeping() {
        let (_server, mut client) = pair();
        client.start_async_read().unwrap();
        assert!(client.is_read_pending());
        client.cancel_read();
        assert!(!client.is_read_pending());

        let mut lone = Channel::client(unique_name(), config()).unwrap();
        assert!(matches!(lone.start_async_read(), Err(ChannelError::NotConnected)));
    }
}
