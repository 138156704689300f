//! `Listener`: the Acceptor-flavored typed async façade (spec §4.7).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::epoll::Ready;
use crate::error::{Error, Result};
use crate::handler::{HandlerId, ReactorEvent};
use crate::object::ObjectId;
use crate::reactor::{Reactor, ReactorContext};
use crate::socket::{AcceptResult, Completion, Socket};
use crate::stream::Stream;

type AcceptCont = Box<dyn FnOnce(&mut ReactorContext, Result<Stream>)>;

struct Inner {
    socket: Socket,
    object: ObjectId,
    handler: Option<HandlerId>,
    accept_cont: Option<AcceptCont>,
    closing: bool,
}

/// A one-shot-per-call acceptor: `accept(f)` installs a completion that
/// hands the new connection to `f` on arrival (spec §4.7).
#[derive(Clone)]
pub struct Listener {
    inner: Rc<RefCell<Inner>>,
}

impl Listener {
    pub fn bind(reactor: &mut Reactor, addr: SocketAddr, backlog: i32) -> Result<Listener> {
        let socket = Socket::listen_on(&addr, backlog)?;
        let fd = socket.raw().raw();
        let object = reactor.register_object();

        let inner = Rc::new(RefCell::new(Inner {
            socket,
            object,
            handler: None,
            accept_cont: None,
            closing: false,
        }));

        let cb_inner = inner.clone();
        let handler = reactor
            .register_device(
                object,
                fd,
                Ready::empty(),
                Box::new(move |ctx, event| Listener::dispatch(&cb_inner, ctx, event)),
            )
            .inspect_err(|_| {
                reactor.unregister_object(object);
            })?;
        inner.borrow_mut().handler = Some(handler);

        Ok(Listener { inner })
    }

    /// Installs a one-shot completion for the next incoming connection.
    pub fn accept(
        &self,
        reactor: &mut Reactor,
        f: impl FnOnce(&mut ReactorContext, Result<Stream>) + 'static,
    ) -> Result<()> {
        if self.inner.borrow().accept_cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let outcome = self.inner.borrow_mut().socket.accept();
        match outcome {
            AcceptResult::Ready(conn) => {
                let handler = self.inner.borrow().handler.ok_or(Error::Canceled)?;
                self.inner.borrow_mut().accept_cont = Some(Box::new(move |ctx, _| {
                    // Consumed directly below; placeholder never runs.
                    let _ = ctx;
                }));
                // Re-queue through the reactor so `f` only ever runs from a
                // dispatch, mirroring Stream's post_* trampoline.
                let stashed = Rc::new(RefCell::new(Some(conn)));
                self.inner.borrow_mut().accept_cont = Some(Box::new(move |ctx, _ignored| {
                    if let Some(socket) = stashed.borrow_mut().take() {
                        let stream = Stream::from_connected(ctx.reactor(), socket);
                        f(ctx, stream);
                    }
                }));
                self.rearm(reactor);
                reactor.post(handler, ReactorEvent::Posted)
            }
            AcceptResult::Pending => {
                self.inner.borrow_mut().accept_cont = Some(Box::new(move |ctx, conn| f(ctx, conn)));
                self.rearm(reactor);
                Ok(())
            }
            AcceptResult::Fail(e) => Err(e),
        }
    }

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
            ReactorEvent::Init | ReactorEvent::Timer => {}
            ReactorEvent::Posted => {
                if inner.borrow().closing {
                    Listener::teardown(inner, ctx, Error::Canceled);
                    return;
                }
                if let Some(cont) = inner.borrow_mut().accept_cont.take() {
                    ctx.clear_error();
                    cont(ctx, Err(Error::Canceled));
                }
            }
            ReactorEvent::Readiness(readiness) => Listener::on_readiness(inner, ctx, readiness),
        }
    }

    fn on_readiness(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, readiness: Ready) {
        let completion = inner.borrow().socket.completion_for(readiness);
        match completion {
            Completion::Clear => {}
            Completion::Error | Completion::Hangup => {
                Listener::teardown(inner, ctx, Error::PeerClosed);
                return;
            }
            _ => {
                let outcome = inner.borrow_mut().socket.accept();
                match outcome {
                    AcceptResult::Ready(socket) => {
                        if let Some(cont) = inner.borrow_mut().accept_cont.take() {
                            ctx.clear_error();
                            let stream = Stream::from_connected(ctx.reactor(), socket);
                            cont(ctx, stream);
                        }
                    }
                    AcceptResult::Pending => {}
                    AcceptResult::Fail(e) => {
                        if let Some(cont) = inner.borrow_mut().accept_cont.take() {
                            ctx.set_error(e.clone_for_report());
                            cont(ctx, Err(e));
                        }
                    }
                }
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

    fn teardown(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, err: Error) {
        let (accept_cont, handler, object) = {
            let mut st = inner.borrow_mut();
            st.closing = true;
            (st.accept_cont.take(), st.handler.take(), st.object)
        };

        if let Some(cont) = accept_cont {
            ctx.set_error(err.clone_for_report());
            cont(ctx, Err(err));
        }
        if let Some(handler) = handler {
            let _ = ctx.reactor().unregister(handler);
        }
        let _ = ctx.reactor().unregister_object(object);
    }
}
