//! Single-threaded cooperative reactor for high-concurrency network
//! services.
//!
//! `solid-reactor` drives many long-lived network objects — connections,
//! listeners, datagram stations, timers — through one epoll-backed event
//! loop per OS thread. Objects never migrate between reactors; a program
//! that wants more concurrency runs one reactor per thread and shares
//! nothing but the posted-event queue.
//!
//! The crate is layered bottom-up:
//!
//! - [`sys`] / [`epoll`] — raw, safe wrappers around `epoll(7)`,
//!   non-blocking sockets and `eventfd(2)`.
//! - [`socket`] / [`secure`] — the non-blocking socket state machine and
//!   its optional TLS-shaped interposer.
//! - [`handler`] / [`object`] / [`timer_heap`] — the bookkeeping that
//!   binds a resource to an owning object and a reactor-invoked callback.
//! - [`reactor`] — the event loop itself.
//! - [`stream`], [`datagram`], [`listener`], [`timer`] — the four typed
//!   async façades user code actually calls.
//! - [`mem_cache`] — a thread-local size-classed allocator available to
//!   the reactor's own internals and to application code that wants the
//!   same small-object recycling.
//!
//! # Example
//!
//! ```no_run
//! use solid_reactor::reactor::{Reactor, ReactorConfig};
//! use solid_reactor::listener::Listener;
//!
//! let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
//! let addr = "127.0.0.1:0".parse().unwrap();
//! let listener = Listener::bind(&mut reactor, addr, 128).unwrap();
//!
//! listener
//!     .accept(&mut reactor, |ctx, conn| {
//!         if let Ok(stream) = conn {
//!             let _ = stream.post_recv_some(ctx.reactor(), 1024, |_ctx, _buf| {});
//!         }
//!     })
//!     .unwrap();
//!
//! reactor.stop(); // in a real program, drive with reactor.run()
//! ```

pub mod datagram;
pub mod epoll;
pub mod error;
pub mod handler;
pub mod listener;
pub mod mem_cache;
pub mod object;
pub mod queue;
pub mod reactor;
pub mod secure;
pub mod socket;
pub mod stream;
pub mod sys;
pub mod timer;
pub mod timer_heap;
pub mod waker;

pub use error::{Error, Result};
pub use reactor::{Reactor, ReactorConfig, ReactorContext, ReactorHandle};
