//! `Timer`: the timer-flavored typed async façade (spec §4.7).
//!
//! Unlike `Stream`/`Datagram`/`Listener`, a `Timer` holds no socket — it
//! registers a timer-only [`crate::handler::HandlerId`] and arms/cancels
//! entries on the reactor's [`crate::timer_heap::TimerHeap`] directly.
//! `storeidx` in spec §4.7 is represented here by whether the handler is
//! currently armed in the heap (`TimerHeap::is_armed`), checked through
//! the reactor rather than a field on this façade, since the heap is the
//! sole owner of that bookkeeping (spec §4.5's back-pointer invariant).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::handler::{HandlerId, ReactorEvent};
use crate::object::ObjectId;
use crate::reactor::{Reactor, ReactorContext};

type FireCont = Box<dyn FnOnce(&mut ReactorContext)>;

struct Inner {
    object: ObjectId,
    handler: Option<HandlerId>,
    cont: Option<FireCont>,
    closing: bool,
}

/// A one-shot timer: arming a new deadline while one is already pending
/// fails with [`Error::OperationInProgress`], matching the "at most one
/// outstanding op per direction" shape the other façades share (spec
/// §4.7 generalizes this to Timer's single direction).
#[derive(Clone)]
pub struct Timer {
    inner: Rc<RefCell<Inner>>,
}

impl Timer {
    pub fn new(reactor: &mut Reactor) -> Result<Timer> {
        let object = reactor.register_object();
        let inner = Rc::new(RefCell::new(Inner {
            object,
            handler: None,
            cont: None,
            closing: false,
        }));

        let cb_inner = inner.clone();
        let handler = reactor
            .register_timer(
                object,
                Box::new(move |ctx, event| Timer::dispatch(&cb_inner, ctx, event)),
            )
            .inspect_err(|_| {
                reactor.unregister_object(object);
            })?;
        inner.borrow_mut().handler = Some(handler);

        Ok(Timer { inner })
    }

    /// Arms the timer to fire `duration` from now.
    pub fn wait_for(
        &self,
        reactor: &mut Reactor,
        duration: Duration,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<()> {
        self.wait_until(reactor, Instant::now() + duration, f)
    }

    /// Arms the timer to fire at `deadline`.
    pub fn wait_until(
        &self,
        reactor: &mut Reactor,
        deadline: Instant,
        f: impl FnOnce(&mut ReactorContext) + 'static,
    ) -> Result<()> {
        if self.inner.borrow().cont.is_some() {
            return Err(Error::OperationInProgress);
        }

        let handler = self.inner.borrow().handler.ok_or(Error::Canceled)?;
        reactor.arm_timer(handler, deadline)?;
        self.inner.borrow_mut().cont = Some(Box::new(f));
        Ok(())
    }

    /// Cancels the armed timer, if any. A no-op if nothing is armed
    /// (spec §8's `cancel(timer); cancel(timer)` idempotence law). The
    /// canceled continuation never fires.
    pub fn cancel(&self, reactor: &mut Reactor) {
        let mut st = self.inner.borrow_mut();
        st.cont = None;
        if let Some(handler) = st.handler {
            reactor.cancel_timer(handler);
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

    fn dispatch(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, event: ReactorEvent) {
        match event {
            ReactorEvent::Init => {}
            ReactorEvent::Readiness(_) => {}
            ReactorEvent::Posted => {
                if inner.borrow().closing {
                    Timer::teardown(inner, ctx, Error::Canceled);
                }
            }
            ReactorEvent::Timer => {
                if let Some(cont) = inner.borrow_mut().cont.take() {
                    ctx.clear_error();
                    cont(ctx);
                }
            }
        }
    }

    fn teardown(inner: &Rc<RefCell<Inner>>, ctx: &mut ReactorContext, err: Error) {
        let (cont, handler, object) = {
            let mut st = inner.borrow_mut();
            st.closing = true;
            (st.cont.take(), st.handler.take(), st.object)
        };

        if let Some(cont) = cont {
            ctx.set_error(err);
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

    #[test]
    fn fires_once_after_its_deadline() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let timer = Timer::new(&mut reactor).unwrap();

        let fired = Rc::new(StdRefCell::new(0));
        let fired_cb = fired.clone();
        timer
            .wait_for(&mut reactor, Duration::from_millis(1), move |_ctx| {
                *fired_cb.borrow_mut() += 1;
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && *fired.borrow() == 0 {
            reactor.run_once().unwrap();
        }

        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn cancel_before_fire_is_idempotent_and_suppresses_the_callback() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let timer = Timer::new(&mut reactor).unwrap();

        let fired = Rc::new(StdRefCell::new(false));
        let fired_cb = fired.clone();
        timer
            .wait_for(&mut reactor, Duration::from_millis(50), move |_ctx| {
                *fired_cb.borrow_mut() = true;
            })
            .unwrap();

        timer.cancel(&mut reactor);
        timer.cancel(&mut reactor);

        for _ in 0..5 {
            reactor.run_once().unwrap();
        }
        assert!(!*fired.borrow());
    }

    #[test]
    fn rearming_while_pending_fails_synchronously() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let timer = Timer::new(&mut reactor).unwrap();

        timer
            .wait_for(&mut reactor, Duration::from_secs(10), |_ctx| {})
            .unwrap();

        let second = timer.wait_for(&mut reactor, Duration::from_secs(10), |_ctx| {});
        assert!(matches!(second, Err(Error::OperationInProgress)));
    }
}
