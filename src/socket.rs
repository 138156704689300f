//! Non-blocking socket state machine: Acceptor, Channel (stream) or
//! Datagram, each hiding at most one pending send and one pending recv at
//! a time, and optionally routing through a [`SecureTransport`].
//!
//! Grounded on queen-io's `sys/socket.rs` (`Socket::new_raw`, the
//! EINPROGRESS-as-pending generalization of `connect_timeout`, `accept`'s
//! EAGAIN/interrupted-retry loop, `recv_with_flags`/`recv_from_with_flags`,
//! `take_error`); `io_request`'s transient/terminal split follows
//! `sys/socket.rs`'s EAGAIN/EWOULDBLOCK-vs-anything-else classification
//! (`crate::sys::is_transient`).

use std::net::SocketAddr;

use crate::epoll::Ready;
use crate::error::Error;
use crate::secure::{SecureTransport, WantMask};
use crate::sys;

/// Which role a [`Socket`] plays. Fixed at construction (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Acceptor,
    Channel,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    PendingConnect,
    Connected,
    Closed,
}

#[derive(Debug)]
pub struct PendingSend {
    pub buf: Vec<u8>,
    pub written: usize,
}

#[derive(Debug)]
pub struct PendingRecv {
    pub capacity: usize,
    pub buf: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum SocketState {
    Acceptor {
        pending_accept: bool,
    },
    Channel {
        state: ChannelState,
        pending_send: Option<PendingSend>,
        pending_recv: Option<PendingRecv>,
        sent: u64,
        received: u64,
    },
    Datagram {
        pending_send: Option<(PendingSend, SocketAddr)>,
        pending_recv: Option<PendingRecv>,
        last_peer: Option<SocketAddr>,
        sent: u64,
        received: u64,
    },
}

/// Outcome of an operation that can complete immediately, park waiting for
/// readiness, or fail terminally.
#[derive(Debug)]
pub enum IoResult {
    Ok,
    Pending,
    Fail(Error),
}

/// Outcome of `recv`/`recv_from`: carries the bytes read on immediate
/// success.
#[derive(Debug)]
pub enum RecvResult {
    Ready(Vec<u8>),
    Pending,
    Fail(Error),
}

/// Outcome of `accept`: carries the new connection on immediate success.
#[derive(Debug)]
pub enum AcceptResult {
    Ready(Socket),
    Pending,
    Fail(Error),
}

/// What a freshly-arrived readiness event means for this socket, computed
/// from its current pending state. The typed handler (§4.7) uses this to
/// sequence its two half-handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Recv,
    Send,
    RecvSend,
    SendRecv,
    Hangup,
    Error,
    Clear,
}

/// Result of a completion entry point (`do_send`/`do_recv`).
#[derive(Debug)]
pub enum Progress {
    Done(usize),
    /// Partial progress — "ignore this signal" per spec §9's open
    /// question on revisions that issued readiness with no pending op.
    None,
    ErrorDone(Error),
}

pub struct Socket {
    fd: sys::socket::Socket,
    kind: SocketKind,
    state: SocketState,
    secure: Option<Box<dyn SecureTransport>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl Socket {
    pub fn new_acceptor(fd: sys::socket::Socket) -> Socket {
        Socket {
            fd,
            kind: SocketKind::Acceptor,
            state: SocketState::Acceptor { pending_accept: false },
            secure: None,
        }
    }

    pub fn new_channel(fd: sys::socket::Socket, connected: bool) -> Socket {
        Socket {
            fd,
            kind: SocketKind::Channel,
            state: SocketState::Channel {
                state: if connected {
                    ChannelState::Connected
                } else {
                    ChannelState::Idle
                },
                pending_send: None,
                pending_recv: None,
                sent: 0,
                received: 0,
            },
            secure: None,
        }
    }

    pub fn new_datagram(fd: sys::socket::Socket) -> Socket {
        Socket {
            fd,
            kind: SocketKind::Datagram,
            state: SocketState::Datagram {
                pending_send: None,
                pending_recv: None,
                last_peer: None,
                sent: 0,
                received: 0,
            },
            secure: None,
        }
    }

    /// Creates, binds and `listen`s an acceptor socket on `addr` (spec
    /// §4.2's `create(address_info)`, specialized to the Acceptor role).
    pub fn listen_on(addr: &SocketAddr, backlog: i32) -> Result<Socket, Error> {
        let fd = sys::socket::Socket::new(addr, libc::SOCK_STREAM)
            .map_err(Error::TransportError)?;
        fd.set_reuseaddr(true).map_err(Error::TransportError)?;
        fd.bind(addr).map_err(Error::TransportError)?;
        fd.listen(backlog).map_err(Error::TransportError)?;
        Ok(Socket::new_acceptor(fd))
    }

    /// Creates a Channel socket and issues a non-blocking `connect(2)`
    /// toward `addr`, returning the socket alongside the immediate
    /// connect outcome.
    pub fn connect_new(addr: &SocketAddr) -> Result<(Socket, IoResult), Error> {
        let fd = sys::socket::Socket::new(addr, libc::SOCK_STREAM)
            .map_err(Error::TransportError)?;
        let mut socket = Socket::new_channel(fd, false);
        let result = socket.connect(addr);
        Ok((socket, result))
    }

    /// Creates and binds a Datagram socket on `addr` (spec §4.2's
    /// `create(address_info)`, specialized to the Datagram role).
    pub fn bind_datagram(addr: &SocketAddr) -> Result<Socket, Error> {
        let fd = sys::socket::Socket::new(addr, libc::SOCK_DGRAM)
            .map_err(Error::TransportError)?;
        fd.bind(addr).map_err(Error::TransportError)?;
        Ok(Socket::new_datagram(fd))
    }

    pub fn set_secure_transport(&mut self, transport: Box<dyn SecureTransport>) -> Result<(), Error> {
        let mut transport = transport;
        transport.attach(self.fd.raw()).map_err(|_| Error::TransportError(std::io::Error::last_os_error()))?;
        self.secure = Some(transport);
        Ok(())
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn raw(&self) -> &sys::socket::Socket {
        &self.fd
    }

    /// Non-blocking `connect(2)` (Channel only).
    pub fn connect(&mut self, addr: &SocketAddr) -> IoResult {
        let SocketState::Channel { state, .. } = &mut self.state else {
            return IoResult::Fail(Error::AddressError);
        };

        if *state != ChannelState::Idle {
            return IoResult::Fail(Error::OperationInProgress);
        }

        match self.fd.connect(addr) {
            Ok(true) => {
                *state = ChannelState::Connected;
                IoResult::Ok
            }
            Ok(false) => {
                *state = ChannelState::PendingConnect;
                IoResult::Pending
            }
            Err(e) => IoResult::Fail(Error::TransportError(e)),
        }
    }

    /// Non-blocking `accept(4)` (Acceptor only).
    pub fn accept(&mut self) -> AcceptResult {
        let SocketState::Acceptor { pending_accept } = &mut self.state else {
            return AcceptResult::Fail(Error::AddressError);
        };

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;

        match self
            .fd
            .accept(&mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        {
            Ok(conn) => {
                *pending_accept = false;
                AcceptResult::Ready(Socket::new_channel(conn, true))
            }
            Err(ref e) if sys::is_transient(e) => {
                *pending_accept = true;
                AcceptResult::Pending
            }
            Err(e) => AcceptResult::Fail(Error::TransportError(e)),
        }
    }

    /// Tries to send `buf` immediately; parks the unsent tail as pending
    /// on partial progress or would-block.
    pub fn send(&mut self, buf: Vec<u8>) -> IoResult {
        let SocketState::Channel {
            pending_send,
            sent,
            ..
        } = &mut self.state
        else {
            return IoResult::Fail(Error::AddressError);
        };

        if pending_send.is_some() {
            return IoResult::Fail(Error::OperationInProgress);
        }

        if buf.is_empty() {
            return IoResult::Ok;
        }

        match write_through(&self.fd, self.secure.as_deref_mut(), &buf) {
            WriteOutcome::Wrote(n) if n == buf.len() => {
                *sent += n as u64;
                IoResult::Ok
            }
            WriteOutcome::Wrote(n) => {
                *sent += n as u64;
                *pending_send = Some(PendingSend {
                    written: n,
                    buf,
                });
                IoResult::Pending
            }
            WriteOutcome::WouldBlock => {
                *pending_send = Some(PendingSend { written: 0, buf });
                IoResult::Pending
            }
            WriteOutcome::Closed => IoResult::Fail(Error::PeerClosed),
            WriteOutcome::Fail(e) => IoResult::Fail(Error::TransportError(e)),
        }
    }

    /// Tries to receive into a buffer of `cap` bytes immediately.
    pub fn recv(&mut self, cap: usize) -> RecvResult {
        let SocketState::Channel {
            pending_recv,
            received,
            ..
        } = &mut self.state
        else {
            return RecvResult::Fail(Error::AddressError);
        };

        if pending_recv.is_some() {
            return RecvResult::Fail(Error::OperationInProgress);
        }

        if cap == 0 {
            return RecvResult::Ready(Vec::new());
        }

        let mut buf = vec![0u8; cap];
        match read_through(&self.fd, self.secure.as_deref_mut(), &mut buf) {
            ReadOutcome::Read(0) => RecvResult::Fail(Error::PeerClosed),
            ReadOutcome::Read(n) => {
                buf.truncate(n);
                *received += n as u64;
                RecvResult::Ready(buf)
            }
            ReadOutcome::WouldBlock => {
                *pending_recv = Some(PendingRecv { capacity: cap, buf: Vec::new() });
                RecvResult::Pending
            }
            ReadOutcome::Fail(e) => RecvResult::Fail(Error::TransportError(e)),
        }
    }

    pub fn send_to(&mut self, buf: Vec<u8>, addr: SocketAddr) -> IoResult {
        let SocketState::Datagram { pending_send, sent, .. } = &mut self.state else {
            return IoResult::Fail(Error::AddressError);
        };

        if pending_send.is_some() {
            return IoResult::Fail(Error::OperationInProgress);
        }

        if buf.is_empty() {
            return IoResult::Ok;
        }

        match self.fd.send_to(&buf, &addr) {
            Ok(n) if n == buf.len() => {
                *sent += n as u64;
                IoResult::Ok
            }
            Ok(_n) => {
                *pending_send = Some((PendingSend { written: 0, buf }, addr));
                IoResult::Pending
            }
            Err(ref e) if sys::is_transient(e) => {
                *pending_send = Some((PendingSend { written: 0, buf }, addr));
                IoResult::Pending
            }
            Err(e) => IoResult::Fail(Error::TransportError(e)),
        }
    }

    pub fn recv_from(&mut self, cap: usize) -> RecvFromResult {
        let SocketState::Datagram {
            pending_recv,
            last_peer,
            received,
            ..
        } = &mut self.state
        else {
            return RecvFromResult::Fail(Error::AddressError);
        };

        if pending_recv.is_some() {
            return RecvFromResult::Fail(Error::OperationInProgress);
        }

        let mut buf = vec![0u8; cap];
        match self.fd.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                *received += n as u64;
                *last_peer = Some(peer);
                RecvFromResult::Ready(buf, peer)
            }
            Err(ref e) if sys::is_transient(e) => {
                *pending_recv = Some(PendingRecv { capacity: cap, buf: Vec::new() });
                RecvFromResult::Pending
            }
            Err(e) => RecvFromResult::Fail(Error::TransportError(e)),
        }
    }

    /// Derived OS interest mask: readable iff a recv is pending, writable
    /// iff a send is pending, folded with the secure transport's
    /// want-events translation when one is attached.
    pub fn io_request(&self) -> Ready {
        let (recv_pending, send_pending) = match &self.state {
            SocketState::Acceptor { pending_accept } => (*pending_accept, false),
            SocketState::Channel {
                pending_recv,
                pending_send,
                state,
                ..
            } => (
                pending_recv.is_some(),
                pending_send.is_some() || *state == ChannelState::PendingConnect,
            ),
            SocketState::Datagram {
                pending_recv,
                pending_send,
                ..
            } => (pending_recv.is_some(), pending_send.is_some()),
        };

        let mut ready = Ready::empty();
        if recv_pending {
            ready |= Ready::readable();
        }
        if send_pending {
            ready |= Ready::writable();
        }

        if let Some(secure) = &self.secure {
            let want = secure.want_events();
            if want.intersects(WantMask::READ | WantMask::READ_ON_READ | WantMask::READ_ON_WRITE) {
                ready |= Ready::readable();
            }
            if want.intersects(WantMask::WRITE | WantMask::WRITE_ON_READ | WantMask::WRITE_ON_WRITE) {
                ready |= Ready::writable();
            }
        }

        ready
    }

    /// Flushes a pending send when writability fires.
    pub fn do_send(&mut self) -> Progress {
        match &mut self.state {
            SocketState::Channel { pending_send, sent, state, .. } => {
                if *state == ChannelState::PendingConnect {
                    match self.fd.take_error() {
                        Ok(None) => {
                            *state = ChannelState::Connected;
                            return Progress::Done(0);
                        }
                        Ok(Some(e)) => return Progress::ErrorDone(Error::TransportError(e)),
                        Err(e) => return Progress::ErrorDone(Error::TransportError(e)),
                    }
                }

                let Some(pending) = pending_send else {
                    return Progress::None;
                };

                let remaining = &pending.buf[pending.written..];
                match self.fd.write(remaining) {
                    Ok(0) => Progress::ErrorDone(Error::PeerClosed),
                    Ok(n) => {
                        pending.written += n;
                        *sent += n as u64;
                        if pending.written == pending.buf.len() {
                            *pending_send = None;
                            Progress::Done(n)
                        } else {
                            Progress::None
                        }
                    }
                    Err(ref e) if sys::is_transient(e) => Progress::None,
                    Err(e) => {
                        *pending_send = None;
                        Progress::ErrorDone(Error::TransportError(e))
                    }
                }
            }
            SocketState::Datagram { pending_send, sent, .. } => {
                let Some((pending, addr)) = pending_send else {
                    return Progress::None;
                };

                match self.fd.send_to(&pending.buf[pending.written..], addr) {
                    Ok(n) => {
                        pending.written += n;
                        *sent += n as u64;
                        if pending.written == pending.buf.len() {
                            *pending_send = None;
                            Progress::Done(n)
                        } else {
                            Progress::None
                        }
                    }
                    Err(ref e) if sys::is_transient(e) => Progress::None,
                    Err(e) => {
                        *pending_send = None;
                        Progress::ErrorDone(Error::TransportError(e))
                    }
                }
            }
            SocketState::Acceptor { .. } => Progress::None,
        }
    }

    /// Flushes a pending recv when readability fires.
    pub fn do_recv(&mut self) -> Progress {
        match &mut self.state {
            SocketState::Channel { pending_recv, received, .. } => {
                let Some(pending) = pending_recv else {
                    return Progress::None;
                };

                let mut buf = vec![0u8; pending.capacity];
                match self.fd.read(&mut buf) {
                    Ok(0) => {
                        *pending_recv = None;
                        Progress::ErrorDone(Error::PeerClosed)
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        pending.buf = buf;
                        *received += n as u64;
                        Progress::Done(n)
                    }
                    Err(ref e) if sys::is_transient(e) => Progress::None,
                    Err(e) => {
                        *pending_recv = None;
                        Progress::ErrorDone(Error::TransportError(e))
                    }
                }
            }
            SocketState::Datagram { pending_recv, last_peer, received, .. } => {
                let Some(pending) = pending_recv else {
                    return Progress::None;
                };

                let mut buf = vec![0u8; pending.capacity];
                match self.fd.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        buf.truncate(n);
                        pending.buf = buf;
                        *last_peer = Some(peer);
                        *received += n as u64;
                        Progress::Done(n)
                    }
                    Err(ref e) if sys::is_transient(e) => Progress::None,
                    Err(e) => {
                        *pending_recv = None;
                        Progress::ErrorDone(Error::TransportError(e))
                    }
                }
            }
            SocketState::Acceptor { .. } => Progress::None,
        }
    }

    /// Maps the current pending state plus observed readiness into the
    /// sequencing decision the typed handler needs (spec §4.6).
    pub fn completion_for(&self, readiness: Ready) -> Completion {
        if readiness.is_error() {
            return Completion::Error;
        }
        if readiness.is_hup() {
            return Completion::Hangup;
        }

        let (recv_pending, send_pending) = match &self.state {
            SocketState::Acceptor { pending_accept } => (*pending_accept, false),
            SocketState::Channel { pending_recv, pending_send, state, .. } => {
                (pending_recv.is_some(), pending_send.is_some() || *state == ChannelState::PendingConnect)
            }
            SocketState::Datagram { pending_recv, pending_send, .. } => {
                (pending_recv.is_some(), pending_send.is_some())
            }
        };

        match (
            recv_pending && readiness.is_readable(),
            send_pending && readiness.is_writable(),
        ) {
            (true, true) => Completion::RecvSend,
            (true, false) => Completion::Recv,
            (false, true) => Completion::Send,
            (false, false) => Completion::Clear,
        }
    }

    /// Current channel state, for the Stream façade's connect trampoline.
    /// `None` for Acceptor/Datagram sockets.
    pub fn channel_state(&self) -> Option<ChannelState> {
        match &self.state {
            SocketState::Channel { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn take_pending_recv_buf(&mut self) -> Option<Vec<u8>> {
        match &mut self.state {
            SocketState::Channel { pending_recv, .. } | SocketState::Datagram { pending_recv, .. } => {
                pending_recv.take().map(|p| p.buf)
            }
            SocketState::Acceptor { .. } => None,
        }
    }

    /// Peer address of the last completed `recv_from` (Datagram only).
    pub fn last_peer(&self) -> Option<SocketAddr> {
        match &self.state {
            SocketState::Datagram { last_peer, .. } => *last_peer,
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum RecvFromResult {
    Ready(Vec<u8>, SocketAddr),
    Pending,
    Fail(Error),
}

enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
    Closed,
    Fail(std::io::Error),
}

fn write_through(
    fd: &sys::socket::Socket,
    secure: Option<&mut Box<dyn SecureTransport>>,
    buf: &[u8],
) -> WriteOutcome {
    if let Some(secure) = secure {
        return match secure.send(buf) {
            crate::secure::TransportResult::Progress(n) => WriteOutcome::Wrote(n),
            crate::secure::TransportResult::Closed => WriteOutcome::Closed,
            crate::secure::TransportResult::WouldBlock => WriteOutcome::WouldBlock,
            crate::secure::TransportResult::Fail => {
                WriteOutcome::Fail(std::io::Error::new(std::io::ErrorKind::Other, "transport failure"))
            }
        };
    }

    match fd.write(buf) {
        Ok(0) => WriteOutcome::Closed,
        Ok(n) => WriteOutcome::Wrote(n),
        Err(e) if sys::is_transient(&e) => WriteOutcome::WouldBlock,
        Err(e) => WriteOutcome::Fail(e),
    }
}

enum ReadOutcome {
    Read(usize),
    WouldBlock,
    Fail(std::io::Error),
}

fn read_through(
    fd: &sys::socket::Socket,
    secure: Option<&mut Box<dyn SecureTransport>>,
    buf: &mut [u8],
) -> ReadOutcome {
    if let Some(secure) = secure {
        return match secure.recv(buf) {
            crate::secure::TransportResult::Progress(n) => ReadOutcome::Read(n),
            crate::secure::TransportResult::Closed => ReadOutcome::Read(0),
            crate::secure::TransportResult::WouldBlock => ReadOutcome::WouldBlock,
            crate::secure::TransportResult::Fail => {
                ReadOutcome::Fail(std::io::Error::new(std::io::ErrorKind::Other, "transport failure"))
            }
        };
    }

    match fd.read(buf) {
        Ok(n) => ReadOutcome::Read(n),
        Err(e) if sys::is_transient(&e) => ReadOutcome::WouldBlock,
        Err(e) => ReadOutcome::Fail(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, Instant};

    fn new_connected_pair() -> (Socket, Socket) {
        let mut listener = Socket::listen_on(&"127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let addr = listener.raw().local_addr().unwrap();

        let (mut client, _) = Socket::connect_new(&addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut server = None;
        while server.is_none() && Instant::now() < deadline {
            match listener.accept() {
                AcceptResult::Ready(socket) => server = Some(socket),
                AcceptResult::Pending => std::thread::yield_now(),
                AcceptResult::Fail(e) => panic!("accept failed: {e}"),
            }
        }
        let server = server.expect("listener never produced a connection");

        while client.channel_state() != Some(ChannelState::Connected) && Instant::now() < deadline
        {
            if let Progress::ErrorDone(e) = client.do_send() {
                panic!("connect failed: {e}");
            }
            std::thread::yield_now();
        }

        (client, server)
    }

    #[test]
    fn zero_length_send_completes_without_touching_the_kernel() {
        let (mut client, _server) = new_connected_pair();
        assert!(matches!(client.send(Vec::new()), IoResult::Ok));
    }

    #[test]
    fn zero_length_recv_is_ready_with_no_bytes() {
        let (_client, mut server) = new_connected_pair();
        match server.recv(0) {
            RecvResult::Ready(buf) => assert!(buf.is_empty()),
            other => panic!("expected Ready([]), got {other:?}"),
        }
    }

    #[test]
    fn completion_for_reports_clear_when_nothing_is_pending() {
        let socket = Socket::bind_datagram(&"127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(
            socket.completion_for(Ready::readable() | Ready::writable()),
            Completion::Clear
        );
    }

    #[test]
    fn completion_for_reports_hangup_and_error_regardless_of_pending_state() {
        let socket = Socket::bind_datagram(&"127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(socket.completion_for(Ready::hup()), Completion::Hangup);
        assert_eq!(socket.completion_for(Ready::error()), Completion::Error);
    }

    #[test]
    fn echo_round_trip_over_a_real_loopback_pair() {
        let (mut client, mut server) = new_connected_pair();

        assert!(matches!(client.send(b"ping".to_vec()), IoResult::Ok));

        let deadline = Instant::now() + Duration::from_secs(2);
        let received = loop {
            match server.recv(4) {
                RecvResult::Ready(buf) => break buf,
                RecvResult::Pending if Instant::now() < deadline => std::thread::yield_now(),
                RecvResult::Pending => panic!("deadline exceeded waiting for data"),
                RecvResult::Fail(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(received, b"ping");
    }
}
