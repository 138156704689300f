//! `Datagram`: the Station-flavored typed async façade (spec §4.7).
//!
//! Analogous to [`crate::stream::Stream`] but carries a peer address on
//! both directions: `recv_from` yields the received bytes alongside the
//! sender's address; `send_to` targets an explicit destination. Grounded
//! the same way as `Stream` — one continuation per direction, installed
//! on a would-block and fired once from a reactor dispatch, never inline.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::epoll::Ready;
use crate::error::{Error, Result};
use crate::handler::{HandlerId, ReactorEvent};
use crate::object::ObjectId;
use crate::reactor::{Reactor, ReactorContext};
use crate::socket::{Completion, IoResult, Progress, RecvFromResult, Socket};

/// Outcome of a façade op that may complete inline.
#[derive(Debug)]
pub enum Async<T> {
    Ready(T),
    Deferred,
}

type RecvCont = Box<dyn FnOnce(&mut ReactorContext, Vec<u8>, Option<SocketAddr>)>;
type SendCont = Box<dyn FnOnce(&mut ReactorContext)>;

struct Inner {
    socket: Socket,
    object: ObjectId,
    handler: Option<HandlerId>,
    recv_cont: Option<RecvCont>,
    send_cont: Option<SendCont>,
    stashed_recv: Option<(Vec<u8>, Option<SocketAddr>)>,
    stashed_send_done: bool,
    closing: bool,
}

/// A connectionless async station: one `recv_from` and one `send_to`
/// continuation outstanding at a time (spec §4.7).
#[derive(Clone)]
pub struct Datagram {
    inner: Rc<RefCell<Inner>>,
}

impl Datagram {
    /// Creates and binds a datagram socket on `addr`, registering it with
    /// `reactor`.
    pub fn bind(reactor: &mut Reactor, addr: SocketAddr) -> Result<Datagram> {
        let socket = Socket::bind_datagram(&addr)?;
        let fd = socket.raw().raw();
        let object = reactor.register_object();

        let inner = Rc::new(RefCell::new(Inner {
            socket,
            object,
            handler: None,
            recv_cont: None,
            send_cont: None,
            stashed_recv: None,
            stashed_send_done: false,
            closing: false,
        }));

        let cb_inner = inner.clone();
        let handler = reactor
            .register_device(
                object,
                fd,
                Ready::empty(),
                Box::new(move |ctx, event| Datagram::dispatch(&cb_inner, ctx, event)),
            )
            .inspect_err(|_| {
                reactor.unregister_object(object);
            })?;
        inner.borrow_mut().handler = Some(handler);

        Ok(Datagram { inner })
    }

    /// Tries a `recv_from` immediately; installs `f` and returns
    /// `Deferred` if it would block.
    pub fn recv_from(
        &self,
        reactor: &mut Reactor,
        cap: usize,
        f: impl FnOnce(&mut ReactorContext, Vec<u8>, Option<SocketAddr>) + 'static,
    ) -> Result<Async<(Vec<u8>, SocketAddr)>> {
        if self.inner.borrow().recv_cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let outcome = self.inner.borrow_mut().socket.recv_from(cap);
        match outcome {
            RecvFromResult::Ready(buf, peer) => {
                self.rearm(reactor);
                Ok(Async::Ready((buf, peer)))
            }
            RecvFromResult::Pending => {
                self.inner.borrow_mut().recv_cont = Some(Box::new(f));
                self.rearm(reactor);
                Ok(Async::Deferred)
            }
            RecvFromResult::Fail(e) => Err(e),
        }
    }

    /// Always defers to the reactor, even on a synchronous completion
    /// (spec §4.7's `post_recv_from`).
    pub fn post_recv_from(
        &self,
        reactor: &mut Reactor,
        cap: usize,
        f: impl FnOnce(&mut ReactorContext, Vec<u8>, Option<SocketAddr>) + 'static,
    ) -> Result<()> {
        match self.recv_from(reactor, cap, f)? {
            Async::Deferred => Ok(()),
            Async::Ready((buf, peer)) => {
                let handler = self.inner.borrow().handler.ok_or(Error::Canceled)?;
                {
                    let mut st = self.inner.borrow_mut();
                    st.stashed_recv = Some((buf, Some(peer)));
                    st.recv_cont = Some(Box::new(f));
                }
                reactor.post(handler, ReactorEvent::Posted)
            }
        }
    }

    /// Sends `buf` to `addr` immediately if possible; installs `f` for the
    /// remainder otherwise.
    pub fn send_to(
        &self,
        reactor: &mut Reactor,
        buf: Vec<u8>,
        addr: SocketAddr,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<Async<()>> {
        if self.inner.borrow().send_cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let outcome = self.inner.borrow_mut().socket.send_to(buf, addr);
        match outcome {
            IoResult::Ok => {
                self.rearm(reactor);
                Ok(Async::Ready(()))
            }
            IoResult::Pending => {
                self.inner.borrow_mut().send_cont = Some(Box::new(f));
                self.rearm(reactor);
                Ok(Async::Deferred)
            }
            IoResult::Fail(e) => Err(e),
        }
    }

    pub fn post_send_to(
        &self,
        reactor: &mut Reactor,
        buf: Vec<u8>,
        addr: SocketAddr,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<()> {
        match self.send_to(reactor, buf, addr, f)? {
            Async::Deferred => Ok(()),
            Async::Ready(()) => {
                let handler = self.inner.borrow().handler.ok_or(Error::Canceled)?;
                {
                    let mut st = self.inner.borrow_mut();
                    st.stashed_send_done = true;
                    st.send_cont = Some(Box::new(f));
                }
                reactor.post(handler, ReactorEvent::Posted)
            }
        }
    }

    /// Cancels any pending op and closes the underlying socket. Mirrors
    /// `Stream::close`'s cancellation-race semantics.
    pub fn close(&self, reactor: &Reactor) -> Result<()> {
        let handler = {
            let mut st = self.inner.borrow_mut();
            if st.closing {
                return Ok(());
            }
            st.closing = true;
            st.handler
        };
        if let Some(handler) = handler {
            reactor.post(handler, ReactorEvent::Posted)?;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.borrow().socket.raw().local_addr()
    }

    fn rearm(&self, reactor: &mut Reactor) {
        let handler = self.inner.borrow().handler;
        if let Some(handler) = handler {
            let interest = self.inner.borrow().socket.io_request();
            let _ = reactor.modify_device(handler, interest);
        }
    }

    fn dispatch(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, event: ReactorEvent) {
        match event {
            ReactorEvent::Init => {}
            ReactorEvent::Timer => {}
            ReactorEvent::Posted => Datagram::on_posted(inner, ctx),
            ReactorEvent::Readiness(readiness) => Datagram::on_readiness(inner, ctx, readiness),
        }
    }

    fn on_posted(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext) {
        if inner.borrow().closing {
            Datagram::teardown(inner, ctx, Error::Canceled);
            return;
        }

        let stashed = inner.borrow_mut().stashed_recv.take();
        if let Some((buf, peer)) = stashed {
            if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                ctx.clear_error();
                cont(ctx, buf, peer);
            }
            return;
        }

        if inner.borrow_mut().stashed_send_done {
            inner.borrow_mut().stashed_send_done = false;
            if let Some(cont) = inner.borrow_mut().send_cont.take() {
                ctx.clear_error();
                cont(ctx);
            }
        }
    }

    fn on_readiness(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, readiness: Ready) {
        let completion = inner.borrow().socket.completion_for(readiness);

        match completion {
            Completion::Clear => {}
            Completion::Error | Completion::Hangup => {
                Datagram::teardown(inner, ctx, Error::PeerClosed);
                return;
            }
            Completion::Recv => Datagram::complete_recv(inner, ctx),
            Completion::Send => Datagram::complete_send(inner, ctx),
            Completion::RecvSend => {
                Datagram::complete_recv(inner, ctx);
                Datagram::complete_send(inner, ctx);
            }
            Completion::SendRecv => {
                Datagram::complete_send(inner, ctx);
                Datagram::complete_recv(inner, ctx);
            }
        }

        let handler = inner.borrow().handler;
        if !inner.borrow().closing {
            if let Some(handler) = handler {
                let interest = inner.borrow().socket.io_request();
                let _ = ctx.reactor().modify_device(handler, interest);
            }
        }
    }

    fn complete_recv(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext) {
        let progress = inner.borrow_mut().socket.do_recv();
        match progress {
            Progress::None => {}
            Progress::Done(_) => {
                let buf = inner
                    .borrow_mut()
                    .socket
                    .take_pending_recv_buf()
                    .unwrap_or_default();
                let peer = inner.borrow().socket.last_peer();
                if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                    ctx.clear_error();
                    cont(ctx, buf, peer);
                }
            }
            Progress::ErrorDone(e) => {
                if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                    ctx.set_error(e);
                    cont(ctx, Vec::new(), None);
                }
            }
        }
    }

    fn complete_send(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext) {
        let progress = inner.borrow_mut().socket.do_send();
        match progress {
            Progress::None => {}
            Progress::Done(_) => {
                if let Some(cont) = inner.borrow_mut().send_cont.take() {
                    ctx.clear_error();
                    cont(ctx);
                }
            }
            Progress::ErrorDone(e) => {
                if let Some(cont) = inner.borrow_mut().send_cont.take() {
                    ctx.set_error(e);
                    cont(ctx);
                }
            }
        }
    }

    fn teardown(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, err: Error) {
        let (recv_cont, send_cont, handler, object) = {
            let mut st = inner.borrow_mut();
            st.closing = true;
            (st.recv_cont.take(), st.send_cont.take(), st.handler.take(), st.object)
        };

        if let Some(cont) = recv_cont {
            ctx.set_error(err.clone_for_report());
            cont(ctx, Vec::new(), None);
        }
        if let Some(cont) = send_cont {
            ctx.set_error(err.clone_for_report());
            cont(ctx);
        }

        if let Some(handler) = handler {
            let _ = ctx.reactor().unregister(handler);
        }
        let _ = ctx.reactor().unregister_object(object);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reactor::ReactorConfig;
    use std::cell::RefCell as StdRefCell;
    use std::time::{Duration, Instant};

    fn run_until(reactor: &mut Reactor, deadline: Instant, mut done: impl FnMut() -> bool) {
        while Instant::now() < deadline {
            reactor.run_once().unwrap();
            if done() {
                return;
            }
        }
        panic!("deadline exceeded waiting for completion");
    }

    #[test]
    fn datagram_echo_between_two_stations() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

        let a = Datagram::bind(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
        let b = Datagram::bind(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let a_got: Rc<StdRefCell<Option<(Vec<u8>, Option<SocketAddr>)>>> =
            Rc::new(StdRefCell::new(None));
        let a_got_cb = a_got.clone();
        a.post_recv_from(&mut reactor, 16, move |_ctx, buf, peer| {
            *a_got_cb.borrow_mut() = Some((buf, peer));
        })
        .unwrap();

        b.post_send_to(&mut reactor, b"x".to_vec(), a_addr, |_ctx| {}).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        run_until(&mut reactor, deadline, || a_got.borrow().is_some());

        let (buf, peer) = a_got.borrow_mut().take().unwrap();
        assert_eq!(buf, b"x");
        assert_eq!(peer, Some(b_addr));

        let b_got: Rc<StdRefCell<Option<Vec<u8>>>> = Rc::new(StdRefCell::new(None));
        let b_got_cb = b_got.clone();
        b.post_recv_from(&mut reactor, 16, move |_ctx, buf, _peer| {
            *b_got_cb.borrow_mut() = Some(buf);
        })
        .unwrap();
        a.post_send_to(&mut reactor, b"x".to_vec(), b_addr, |_ctx| {}).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        run_until(&mut reactor, deadline, || b_got.borrow().is_some());
        assert_eq!(b_got.borrow().as_deref(), Some(b"x".as_slice()));
    }
}
