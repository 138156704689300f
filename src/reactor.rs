//! The single-threaded event loop: owns the epoll selector, the handler
//! table, the object table, the timer heap and the cross-thread posted
//! event queue, and drives them through one fixed five-step turn.
//!
//! Grounded on `original_source/branches/work/frame/aio/src/aioreactor.cpp`
//! (`Reactor::run`'s loop shape: drain events, drain timers, poll, dispatch
//! newly-added completions) and on queen-io's `evloop/mod.rs` for the
//! general "selector + events buffer + timeout bookkeeping" skeleton. The
//! handler table uses `slab::Slab` for storage (per the crate's dependency
//! table) with a thin generation-reuse layer on top, since `slab` itself
//! does not track a removed slot's generation the way [`crate::object`]'s
//! hand-rolled table does — see `DESIGN.md`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::epoll::{Epoll, EpollOpt, Event, Events, Ready, Source, Token};
use crate::error::{Error, Result};
use crate::handler::{Callback, HandlerId, HandlerKind, HandlerSlot, ReactorEvent};
use crate::object::{ObjectId, ObjectTable, PostedEvent};
use crate::queue::Queue;
use crate::timer_heap::TimerHeap;

/// Token reserved for the posted-event queue's wakeup eventfd. Device
/// handlers are tokened by their slab index, which never reaches `usize::MAX`
/// in practice, so the two spaces cannot collide.
const QUEUE_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    /// Capacity of the `epoll_wait` events buffer.
    pub events_capacity: usize,
    /// Upper bound on how long a turn blocks in `epoll_wait` when no timer
    /// is armed sooner.
    pub max_idle: Duration,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            events_capacity: 1024,
            max_idle: Duration::from_millis(100),
        }
    }
}

/// A cheap, `Send + Clone` handle other threads use to post events into a
/// running reactor without touching its single-threaded state directly.
#[derive(Clone)]
pub struct ReactorHandle {
    posted: Queue<PostedEvent>,
}

impl ReactorHandle {
    pub fn post(&self, handler: HandlerId, event: ReactorEvent) -> Result<()> {
        self.posted
            .push(PostedEvent { handler, event })
            .map_err(|_| Error::CapacityError)
    }
}

pub struct Reactor {
    epoll: Epoll,
    handlers: Slab<HandlerSlot>,
    free_handlers: Vec<usize>,
    objects: ObjectTable,
    timers: TimerHeap,
    posted: Queue<PostedEvent>,
    events: Events,
    pending_init: Vec<HandlerId>,
    max_idle: Duration,
    running: bool,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Reactor> {
        let epoll = Epoll::new().map_err(Error::TransportError)?;
        let posted = Queue::unbounded().map_err(Error::TransportError)?;
        posted
            .add(&epoll, QUEUE_TOKEN, Ready::readable(), EpollOpt::level())
            .map_err(Error::TransportError)?;

        Ok(Reactor {
            epoll,
            handlers: Slab::new(),
            free_handlers: Vec::new(),
            objects: ObjectTable::new(),
            timers: TimerHeap::new(),
            posted,
            events: Events::with_capacity(config.events_capacity),
            pending_init: Vec::new(),
            max_idle: config.max_idle,
            running: false,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            posted: self.posted.clone(),
        }
    }

    pub fn register_object(&mut self) -> ObjectId {
        self.objects.insert()
    }

    /// Unregisters an object and every handler still bound to it.
    pub fn unregister_object(&mut self, id: ObjectId) -> bool {
        if !self.objects.contains(id) {
            return false;
        }

        let handlers: Vec<HandlerId> = self
            .handlers
            .iter()
            .filter(|(_, slot)| slot.registered && slot.owner == id)
            .map(|(index, slot)| HandlerId {
                index,
                generation: slot.generation,
            })
            .collect();

        for handler in handlers {
            let _ = self.unregister(handler);
        }

        self.objects.remove(id)
    }

    fn insert_slot(&mut self, owner: ObjectId) -> HandlerId {
        if let Some(index) = self.free_handlers.pop() {
            let generation = self.handlers[index].reuse(owner);
            HandlerId { index, generation }
        } else {
            let index = self.handlers.insert(HandlerSlot::new(owner));
            HandlerId { index, generation: 0 }
        }
    }

    /// Binds a raw, already non-blocking descriptor to `owner` and arms it
    /// for `interest`. The reactor keeps the fd only to add/modify/delete
    /// its epoll registration; the owning facade (`Socket`, a stream, a
    /// listener) keeps the descriptor alive.
    pub fn register_device(
        &mut self,
        owner: ObjectId,
        fd: RawFd,
        interest: Ready,
        callback: Callback,
    ) -> Result<HandlerId> {
        if !self.objects.contains(owner) {
            return Err(crate::handler::not_registered());
        }

        let handler = self.insert_slot(owner);
        let token = Token(handler.index);

        if let Err(e) = self.epoll.add(&fd, token, interest, EpollOpt::level()) {
            self.free_handlers.push(handler.index);
            self.handlers[handler.index].tombstone();
            tracing::warn!(?owner, fd, error = %e, "register_device failed");
            return Err(Error::TransportError(e));
        }

        let slot = &mut self.handlers[handler.index];
        slot.kind = Some(HandlerKind::Device { token, fd });
        slot.callback = callback;
        slot.active = true;

        self.objects.add_handler(owner, handler);
        self.pending_init.push(handler);
        tracing::trace!(?owner, fd, index = handler.index, "registered device handler");
        Ok(handler)
    }

    /// Changes the interest mask of an already-registered device handler —
    /// called whenever a socket's pending-op shape changes (spec §4.6).
    pub fn modify_device(&mut self, handler: HandlerId, interest: Ready) -> Result<()> {
        let slot = self
            .handlers
            .get(handler.index)
            .filter(|s| s.registered && s.generation == handler.generation)
            .ok_or_else(crate::handler::not_registered)?;

        match slot.kind {
            Some(HandlerKind::Device { token, fd }) => self
                .epoll
                .modify(&fd, token, interest, EpollOpt::level())
                .map_err(Error::TransportError),
            _ => Err(crate::handler::not_registered()),
        }
    }

    /// Registers a timer-driven handler. It holds no OS descriptor and is
    /// not armed until [`Reactor::arm_timer`] is called.
    pub fn register_timer(&mut self, owner: ObjectId, callback: Callback) -> Result<HandlerId> {
        if !self.objects.contains(owner) {
            return Err(crate::handler::not_registered());
        }

        let handler = self.insert_slot(owner);
        let slot = &mut self.handlers[handler.index];
        slot.kind = Some(HandlerKind::Timer);
        slot.callback = callback;
        slot.active = true;

        self.objects.add_handler(owner, handler);
        self.pending_init.push(handler);
        Ok(handler)
    }

    pub fn arm_timer(&mut self, handler: HandlerId, deadline: Instant) -> Result<()> {
        self.check_timer_handler(handler)?;
        self.timers.add(deadline, handler);
        Ok(())
    }

    pub fn cancel_timer(&mut self, handler: HandlerId) {
        self.timers.cancel(handler);
    }

    fn check_timer_handler(&self, handler: HandlerId) -> Result<()> {
        match self.handlers.get(handler.index) {
            Some(slot)
                if slot.registered
                    && slot.generation == handler.generation
                    && matches!(slot.kind, Some(HandlerKind::Timer)) =>
            {
                Ok(())
            }
            _ => Err(crate::handler::not_registered()),
        }
    }

    /// Tears down one handler: deletes its epoll registration (if any),
    /// cancels any armed timer, detaches it from its owning object, and
    /// tombstones its slot so the index can be safely reused.
    pub fn unregister(&mut self, handler: HandlerId) -> Result<()> {
        let slot = self
            .handlers
            .get(handler.index)
            .filter(|s| s.registered && s.generation == handler.generation)
            .ok_or_else(crate::handler::not_registered)?;

        if let Some(HandlerKind::Device { fd, .. }) = slot.kind {
            let _ = self.epoll.delete(&fd);
        }

        tracing::trace!(index = handler.index, generation = handler.generation, "unregistered handler");
        let owner = slot.owner;
        self.timers.cancel(handler);
        self.objects.remove_handler(owner, handler);
        self.handlers[handler.index].tombstone();
        self.free_handlers.push(handler.index);
        self.pending_init.retain(|h| *h != handler);
        Ok(())
    }

    pub fn post(&self, handler: HandlerId, event: ReactorEvent) -> Result<()> {
        self.posted
            .push(PostedEvent { handler, event })
            .map_err(|_| Error::CapacityError)
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Runs turns until [`Reactor::stop`] is called from inside a callback.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        while self.running {
            self.run_once()?;
        }
        Ok(())
    }

    /// One full turn: drain posted events, drain expired timers, poll for
    /// readiness, dispatch freshly-registered handlers' init event.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn run_once(&mut self) -> Result<()> {
        let now = Instant::now();

        self.drain_posted();
        self.drain_timers(now);
        self.poll_and_dispatch(now)?;
        self.dispatch_pending_init();

        Ok(())
    }

    fn drain_posted(&mut self) {
        while let Ok(posted) = self.posted.pop() {
            self.dispatch(posted.handler, posted.event);
        }
    }

    fn drain_timers(&mut self, now: Instant) {
        for handler in self.timers.pop_expired(now) {
            tracing::trace!(index = handler.index, generation = handler.generation, "timer fired");
            self.dispatch(handler, ReactorEvent::Timer);
        }
    }

    fn poll_and_dispatch(&mut self, now: Instant) -> Result<()> {
        let timeout = match self.timers.next_deadline() {
            Some(deadline) if deadline > now => self.max_idle.min(deadline - now),
            Some(_) => Duration::from_millis(0),
            None => self.max_idle,
        };

        match self.epoll.wait(&mut self.events, Some(timeout)) {
            Ok(_) => {}
            Err(ref e) if crate::sys::is_transient(e) => return Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "epoll_wait failed");
                return Err(Error::TransportError(e));
            }
        }

        let fired: Vec<Event> = self.events.iter().collect();
        for event in fired {
            let token = event.token();
            if token == QUEUE_TOKEN {
                continue;
            }

            let index = usize::from(token);
            if let Some(slot) = self.handlers.get(index) {
                if slot.registered && matches!(slot.kind, Some(HandlerKind::Device { .. })) {
                    let handler = HandlerId {
                        index,
                        generation: slot.generation,
                    };
                    self.dispatch(handler, ReactorEvent::Readiness(event.readiness()));
                }
            }
        }

        Ok(())
    }

    fn dispatch_pending_init(&mut self) {
        let pending = std::mem::take(&mut self.pending_init);
        for handler in pending {
            self.dispatch(handler, ReactorEvent::Init);
        }
    }

    fn dispatch(&mut self, handler: HandlerId, event: ReactorEvent) {
        let valid = matches!(
            self.handlers.get(handler.index),
            Some(slot) if slot.registered && slot.generation == handler.generation
        );
        if !valid {
            return;
        }

        let mut callback = std::mem::replace(
            &mut self.handlers[handler.index].callback,
            Box::new(|_ctx, _event| {}),
        );

        {
            let mut ctx = ReactorContext {
                reactor: self,
                handler,
                error: None,
                system_error: None,
            };
            callback(&mut ctx, event);
        }

        if let Some(slot) = self.handlers.get_mut(handler.index) {
            if slot.registered && slot.generation == handler.generation {
                slot.callback = callback;
            }
        }
    }
}

/// View a callback gets into the reactor for the duration of one
/// dispatch: the current handler's identity, the two error channels, and
/// full access back into the reactor for further registration/posting.
pub struct ReactorContext<'a> {
    reactor: &'a mut Reactor,
    handler: HandlerId,
    error: Option<Error>,
    system_error: Option<io::Error>,
}

impl<'a> ReactorContext<'a> {
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn object(&self) -> Option<ObjectId> {
        self.reactor
            .handlers
            .get(self.handler.index)
            .filter(|s| s.generation == self.handler.generation)
            .map(|s| s.owner)
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn system_error(&self) -> Option<&io::Error> {
        self.system_error.as_ref()
    }

    pub fn set_error(&mut self, err: Error) {
        self.error = Some(err);
    }

    pub fn set_system_error(&mut self, err: io::Error) {
        self.system_error = Some(err);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.system_error = None;
    }

    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn posted_event_reaches_its_handler() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let owner = reactor.register_object();

        let fired = Rc::new(RefCell::new(false));
        let fired_cb = fired.clone();

        let handler = reactor
            .register_timer(
                owner,
                Box::new(move |_ctx, event| {
                    if matches!(event, ReactorEvent::Posted) {
                        *fired_cb.borrow_mut() = true;
                    }
                }),
            )
            .unwrap();

        // Drop the synchronous Init dispatch before asserting on Posted.
        reactor.run_once().unwrap();
        assert!(!*fired.borrow());

        reactor.post(handler, ReactorEvent::Posted).unwrap();
        reactor.run_once().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn timer_fires_once_then_unregister_drops_stale_handler() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let owner = reactor.register_object();

        let count = Rc::new(RefCell::new(0));
        let count_cb = count.clone();

        let handler = reactor
            .register_timer(
                owner,
                Box::new(move |_ctx, event| {
                    if matches!(event, ReactorEvent::Timer) {
                        *count_cb.borrow_mut() += 1;
                    }
                }),
            )
            .unwrap();

        reactor.arm_timer(handler, Instant::now()).unwrap();
        reactor.run_once().unwrap();
        assert_eq!(*count.borrow(), 1);

        reactor.unregister(handler).unwrap();
        assert!(reactor.post(handler, ReactorEvent::Posted).is_err() || {
            // post() itself only fails on a closed/full queue; the staleness
            // guard lives in dispatch, so drive one more turn and confirm
            // the count does not advance.
            reactor.run_once().unwrap();
            *count.borrow() == 1
        });
    }

    #[test]
    fn unregister_object_tears_down_all_its_handlers() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let owner = reactor.register_object();

        let h1 = reactor
            .register_timer(owner, Box::new(|_ctx, _event| {}))
            .unwrap();
        let h2 = reactor
            .register_timer(owner, Box::new(|_ctx, _event| {}))
            .unwrap();

        assert!(reactor.unregister_object(owner));
        assert!(reactor.modify_device(h1, Ready::readable()).is_err());
        assert!(reactor.arm_timer(h2, Instant::now()).is_err());
    }
}
