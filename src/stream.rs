//! `Stream`: the Channel-flavored typed async façade (spec §4.7).
//!
//! Layers one-shot `recv_some`/`send_all`/`connect` continuations on top
//! of [`crate::socket::Socket`] + [`crate::handler`]. Grounded on
//! `original_source/branches/work/frame/aio/src/aiosingleobject.cpp`'s
//! `postRecvSome`/`postSendAll` shape (install a continuation, return
//! `Deferred`, let readiness drive completion) and on the reactor's own
//! posted-event path for the connect trampoline described in spec §4.7.
//!
//! The façade and the reactor-owned callback both need to reach the same
//! socket and continuation slots, so they share an `Rc<RefCell<..>>` —
//! sound because a reactor and everything registered with it live on one
//! thread.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::epoll::Ready;
use crate::error::{Error, Result};
use crate::handler::{HandlerId, ReactorEvent};
use crate::object::ObjectId;
use crate::reactor::{Reactor, ReactorContext};
use crate::socket::{ChannelState, Completion, IoResult, Progress, RecvResult, Socket};

/// Outcome of a façade op that may complete inline.
#[derive(Debug)]
pub enum Async<T> {
    Ready(T),
    Deferred,
}

type RecvCont = Box<dyn FnOnce(&mut ReactorContext, Vec<u8>)>;
type SendCont = Box<dyn FnOnce(&mut ReactorContext)>;
type ConnectCont = Box<dyn FnOnce(&mut ReactorContext)>;

struct Inner {
    socket: Socket,
    object: ObjectId,
    handler: Option<HandlerId>,
    connecting: bool,
    connect_cont: Option<ConnectCont>,
    recv_cont: Option<RecvCont>,
    send_cont: Option<SendCont>,
    /// A recv/send that `post_*` completed synchronously, stashed until
    /// the reactor thread redelivers it — `post_*` never calls `f` inline.
    stashed_recv: Option<Vec<u8>>,
    stashed_send_done: bool,
    closing: bool,
}

/// A connection-oriented async stream: one recv and one send continuation
/// outstanding at a time (spec §4.7).
#[derive(Clone)]
pub struct Stream {
    inner: Rc<RefCell<Inner>>,
}

impl Stream {
    /// Creates the descriptor, registers it with `reactor`, initiates a
    /// non-blocking connect toward `addr`, and arranges for `f` to be
    /// called — on the reactor thread, never inline — once the connect
    /// resolves.
    pub fn connect(
        reactor: &mut Reactor,
        addr: SocketAddr,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<Stream> {
        let (socket, connect_result) = Socket::connect_new(&addr)?;
        if let IoResult::Fail(e) = connect_result {
            return Err(e);
        }

        let stream = Stream::new_registered(reactor, socket, true)?;
        stream.inner.borrow_mut().connect_cont = Some(Box::new(f));

        let handler = stream.inner.borrow().handler.expect("just registered");
        let _ = reactor.post(handler, ReactorEvent::Posted);

        Ok(stream)
    }

    /// Wraps an already-connected socket (e.g. one handed over by
    /// [`crate::listener::Listener::accept`]).
    pub fn from_connected(reactor: &mut Reactor, socket: Socket) -> Result<Stream> {
        Stream::new_registered(reactor, socket, false)
    }

    fn new_registered(reactor: &mut Reactor, socket: Socket, connecting: bool) -> Result<Stream> {
        let fd = socket.raw().raw();
        let object = reactor.register_object();
        let interest = socket.io_request();

        let inner = Rc::new(RefCell::new(Inner {
            socket,
            object,
            handler: None,
            connecting,
            connect_cont: None,
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
                interest,
                Box::new(move |ctx, event| Stream::dispatch(&cb_inner, ctx, event)),
            )
            .inspect_err(|_| {
                reactor.unregister_object(object);
            })?;
        inner.borrow_mut().handler = Some(handler);

        Ok(Stream { inner })
    }

    /// Tries a recv immediately; installs `f` and returns `Deferred` if it
    /// would block.
    pub fn recv_some(
        &self,
        reactor: &mut Reactor,
        cap: usize,
        f: impl FnOnce(&mut ReactorContext, Vec<u8>) + 'static,
    ) -> Result<Async<Vec<u8>>> {
        if self.inner.borrow().recv_cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let outcome = self.inner.borrow_mut().socket.recv(cap);
        match outcome {
            RecvResult::Ready(buf) => {
                self.rearm(reactor);
                Ok(Async::Ready(buf))
            }
            RecvResult::Pending => {
                self.inner.borrow_mut().recv_cont = Some(Box::new(f));
                self.rearm(reactor);
                Ok(Async::Deferred)
            }
            RecvResult::Fail(e) => Err(e),
        }
    }

    /// Always defers to the reactor, even when the recv completes
    /// synchronously (spec §4.7's `post_recv_some`): `f` only ever runs
    /// from a dispatch.
    pub fn post_recv_some(
        &self,
        reactor: &mut Reactor,
        cap: usize,
        f: impl FnOnce(&mut ReactorContext, Vec<u8>) + 'static,
    ) -> Result<()> {
        match self.recv_some(reactor, cap, f)? {
            Async::Deferred => Ok(()),
            Async::Ready(buf) => {
                let handler = self.inner.borrow().handler.ok_or(Error::Canceled)?;
                {
                    let mut st = self.inner.borrow_mut();
                    st.stashed_recv = Some(buf);
                    st.recv_cont = Some(Box::new(f));
                }
                reactor.post(handler, ReactorEvent::Posted)
            }
        }
    }

    /// Sends `buf` immediately if possible; installs `f` for the
    /// remainder otherwise. `f` fires once the whole buffer is
    /// acknowledged or on terminal error.
    pub fn send_all(
        &self,
        reactor: &mut Reactor,
        buf: Vec<u8>,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<Async<()>> {
        if self.inner.borrow().send_cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let outcome = self.inner.borrow_mut().socket.send(buf);
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

    pub fn post_send_all(
        &self,
        reactor: &mut Reactor,
        buf: Vec<u8>,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<()> {
        match self.send_all(reactor, buf, f)? {
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

    /// Cancels any pending op and closes the underlying socket. Pending
    /// continuations fire exactly once more, with `Canceled`, on the next
    /// turn (spec §5's cancellation-race law).
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

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.borrow().socket.raw().peer_addr()
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
            ReactorEvent::Posted => Stream::on_posted(inner, ctx),
            ReactorEvent::Readiness(readiness) => Stream::on_readiness(inner, ctx, readiness),
        }
    }

    fn on_posted(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext) {
        if inner.borrow().closing {
            Stream::teardown(inner, ctx, Error::Canceled);
            return;
        }

        if inner.borrow().connecting {
            let immediate = inner.borrow().socket.channel_state() == Some(ChannelState::Connected);
            if immediate {
                inner.borrow_mut().connecting = false;
                ctx.clear_error();
                if let Some(cont) = inner.borrow_mut().connect_cont.take() {
                    cont(ctx);
                }
            }
            // Still PendingConnect: wait for the writable readiness that
            // `complete_send` will translate into the same trampoline.
            return;
        }

        let stashed = inner.borrow_mut().stashed_recv.take();
        if let Some(buf) = stashed {
            if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                ctx.clear_error();
                cont(ctx, buf);
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
            Completion::Clear => {
                // No pending op found this readiness — dropped per spec §7.
            }
            Completion::Error | Completion::Hangup => {
                Stream::teardown(inner, ctx, Error::PeerClosed);
                return;
            }
            Completion::Recv => Stream::complete_recv(inner, ctx),
            Completion::Send => Stream::complete_send(inner, ctx),
            Completion::RecvSend => {
                Stream::complete_recv(inner, ctx);
                Stream::complete_send(inner, ctx);
            }
            Completion::SendRecv => {
                Stream::complete_send(inner, ctx);
                Stream::complete_recv(inner, ctx);
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
                if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                    ctx.clear_error();
                    cont(ctx, buf);
                }
            }
            Progress::ErrorDone(e) => {
                if let Some(cont) = inner.borrow_mut().recv_cont.take() {
                    ctx.set_error(e);
                    cont(ctx, Vec::new());
                }
            }
        }
    }

    fn complete_send(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext) {
        let was_connecting = inner.borrow().connecting;
        let progress = inner.borrow_mut().socket.do_send();

        if was_connecting {
            match progress {
                Progress::Done(_) => {
                    inner.borrow_mut().connecting = false;
                    ctx.clear_error();
                    if let Some(cont) = inner.borrow_mut().connect_cont.take() {
                        cont(ctx);
                    }
                }
                Progress::ErrorDone(e) => {
                    inner.borrow_mut().connecting = false;
                    ctx.set_error(e);
                    if let Some(cont) = inner.borrow_mut().connect_cont.take() {
                        cont(ctx);
                    }
                }
                Progress::None => {}
            }
            return;
        }

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
        let (recv_cont, send_cont, connect_cont, handler, object) = {
            let mut st = inner.borrow_mut();
            st.closing = true;
            (
                st.recv_cont.take(),
                st.send_cont.take(),
                st.connect_cont.take(),
                st.handler.take(),
                st.object,
            )
        };

        ctx.set_error(err);
        if let Some(cont) = recv_cont {
            cont(ctx, Vec::new());
        }
        if let Some(cont) = send_cont {
            cont(ctx);
        }
        if let Some(cont) = connect_cont {
            cont(ctx);
        }

        if let Some(handler) = handler {
            let _ = ctx.reactor().unregister(handler);
        }
        let _ = ctx.reactor().unregister_object(object);
    }
}
