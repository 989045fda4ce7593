//! `SOCK_SEQPACKET` Unix socket wrappers for mio-based I/O.
//!
//! Sequenced-packet sockets are connection-oriented like stream sockets but
//! keep message boundaries: every `send` is delivered as exactly one `recv`.
//! All sockets are created non-blocking and close-on-exec; readiness comes
//! from mio through [`SourceFd`].

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use rustix::net::{
    AddressFamily, SendFlags, Shutdown, SocketAddrUnix, SocketFlags, SocketType, UCred, sockopt,
};

use super::endpoint::EndpointName;

fn new_socket() -> io::Result<OwnedFd> {
    let fd = rustix::net::socket_with(
        AddressFamily::UNIX,
        SocketType::SEQPACKET,
        SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
        None,
    )?;
    Ok(fd)
}

fn abstract_addr(name: &EndpointName) -> io::Result<SocketAddrUnix> {
    Ok(SocketAddrUnix::new_abstract_name(name.as_bytes())?)
}

/// A connected, non-blocking sequenced-packet socket.
#[derive(Debug)]
pub struct SeqPacketSocket {
    fd: OwnedFd,
}

impl SeqPacketSocket {
    /// Connects to the listener bound to `name`.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` if nothing listens on the name, `WouldBlock` if
    /// the listener's backlog is full, or any other socket error.
    pub fn connect(name: &EndpointName) -> io::Result<Self> {
        let fd = new_socket()?;
        rustix::net::connect(&fd, &abstract_addr(name)?)?;
        Ok(Self { fd })
    }

    /// Sends one message. Never raises `SIGPIPE`.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if the send buffer is full, `BrokenPipe` if the peer
    /// closed, or any other socket error.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(rustix::net::send(&self.fd, buf, SendFlags::NOSIGNAL)?)
    }

    /// Receives one message. A message longer than `buf` is truncated.
    /// Returns `Ok(0)` at end of stream.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if no message is queued, or any other socket error.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(rustix::io::read(&self.fd, buf)?)
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_send(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.send(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Total bytes queued for reading, zero when nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the ioctl fails.
    pub fn pending_bytes(&self) -> io::Result<u64> {
        Ok(rustix::io::ioctl_fionread(&self.fd)?)
    }

    /// Credentials of the connected peer process.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn peer_credentials(&self) -> io::Result<UCred> {
        Ok(sockopt::socket_peercred(&self.fd)?)
    }

    /// Shuts down both directions; the peer sees end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not connected.
    pub fn shutdown(&self) -> io::Result<()> {
        rustix::net::shutdown(&self.fd, Shutdown::Both)?;
        Ok(())
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        sockopt::set_socket_send_buffer_size(&self.fd, size)?;
        Ok(())
    }
}

impl AsFd for SeqPacketSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SeqPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Source for SeqPacketSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

/// A non-blocking listening socket bound to an abstract name.
#[derive(Debug)]
pub struct SeqPacketListener {
    fd: OwnedFd,
}

impl SeqPacketListener {
    /// Binds `name` and starts listening.
    ///
    /// # Errors
    ///
    /// `AddrInUse` if another socket owns the name, or any other socket error.
    pub fn bind(name: &EndpointName, backlog: i32) -> io::Result<Self> {
        let listener = Self::bind_unlistened(name)?;
        rustix::net::listen(&listener.fd, backlog)?;
        Ok(listener)
    }

    /// Binds `name` without listening. Used to check for an existing owner.
    pub(crate) fn bind_unlistened(name: &EndpointName) -> io::Result<Self> {
        let fd = new_socket()?;
        rustix::net::bind(&fd, &abstract_addr(name)?)?;
        Ok(Self { fd })
    }

    /// Accepts a pending connection.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if no connection is pending, or any other socket error.
    pub fn accept(&self) -> io::Result<SeqPacketSocket> {
        let fd = rustix::net::accept_with(&self.fd, SocketFlags::NONBLOCK | SocketFlags::CLOEXEC)?;
        Ok(SeqPacketSocket { fd })
    }

    /// Attempts to accept, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_accept(&self) -> io::Result<Option<SeqPacketSocket>> {
        match self.accept() {
            Ok(sock) => Ok(Some(sock)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for SeqPacketListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Source for SeqPacketListener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd.as_raw_fd()).deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn unique_name() -> EndpointName {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        EndpointName::new(format!("tandem.socket.{}.{n}", std::process::id())).unwrap()
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let err = SeqPacketSocket::connect(&unique_name()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn second_bind_is_addr_in_use() {
        let name = unique_name();
        let _first = SeqPacketListener::bind(&name, 1).unwrap();
        let err = SeqPacketListener::bind(&name, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn message_boundaries_are_preserved() {
        let name = unique_name();
        let listener = SeqPacketListener::bind(&name, 1).unwrap();
        let client = SeqPacketSocket::connect(&name).unwrap();
        let server = listener.accept().unwrap();

        client.send(b"abc").unwrap();
        client.send(b"defgh").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(server.pending_bytes().unwrap(), 8);
        assert_eq!(server.recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(server.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"defgh");
        assert_eq!(server.try_recv(&mut buf).unwrap(), None);
    }

    #[test]
    fn shutdown_yields_end_of_stream() {
        let name = unique_name();
        let listener = SeqPacketListener::bind(&name, 1).unwrap();
        let client = SeqPacketSocket::connect(&name).unwrap();
        let server = listener.accept().unwrap();

        server.shutdown().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.recv(&mut buf).unwrap(), 0);
        assert_eq!(
            client.send(b"x").unwrap_err().kind(),
            ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn peer_credentials_name_this_process() {
        let name = unique_name();
        let listener = SeqPacketListener::bind(&name, 1).unwrap();
        let _client = SeqPacketSocket::connect(&name).unwrap();
        let server = listener.accept().unwrap();

        let cred = server.peer_credentials().unwrap();
        assert_eq!(cred.uid, rustix::process::getuid());
    }

    #[test]
    fn accept_without_pending_connection() {
        let listener = SeqPacketListener::bind(&unique_name(), 1).unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }
}
