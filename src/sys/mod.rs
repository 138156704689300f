//! Raw OS glue: fd wrapper, epoll(7) syscalls, eventfd and non-blocking
//! socket syscalls. Everything above this module talks in terms of
//! `crate::epoll` (the safe selector) and `crate::socket` (the safe socket
//! state machine); nothing outside `sys` calls libc directly.

pub mod common;
pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod socket;

pub use common::{AsInner, FromInner, IntoInner};
pub use epoll::{Epoll, Events};
pub use eventfd::EventFd;
pub use fd::FileDesc;
pub use socket::Socket;

pub(crate) use std::io;

/// Runs a libc call and turns a `-1` return into the last OS error,
/// retrying transparently on `EINTR`.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        loop {
            let res = unsafe { libc::$fn($($arg),*) };
            if res == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(err);
            }
            break Ok(res);
        }
    }};
}

pub(crate) use syscall;

/// Classifies a raw I/O error as transient (retry once readiness fires
/// again) or terminal, per spec §4.2's error policy.
pub fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
