//! `CompletionHandler`: binds one resource (a socket or a timer) to an
//! owning [`crate::object::ObjectId`] and a reactor-invoked callback.
//!
//! Grounded on `original_source/branches/work/frame/aio/aiocompletion.hpp`:
//! `CompletionHandler::on_init_completion`, `isActive`/`isRegistered`,
//! `activate`/`deactivate`/`unregister`, and the `CallbackT` function
//! pointer field. The C++ intrusive sibling-list pointer (`pprev`) becomes
//! a plain `Vec<HandlerId>` owned by the `Object`; the raw `idxreactor`
//! index becomes a checked `HandlerId { index, generation }` so a callback
//! can never fire through a freed slot.

use std::os::unix::io::RawFd;

use crate::epoll::Token;
use crate::error::Error;
use crate::object::ObjectId;

/// Checked reference to a [`HandlerSlot`] inside a reactor's handler table.
/// Carries a generation so a stale id (from a handler that has since been
/// unregistered and its slot reused) is detected rather than dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl HandlerId {
    #[cfg(test)]
    pub(crate) fn for_test(index: usize, generation: u64) -> HandlerId {
        HandlerId { index, generation }
    }
}

/// The event the reactor observed when it invoked a handler's callback.
#[derive(Debug, Clone, Copy)]
pub enum ReactorEvent {
    /// Posted once, synchronously, right after a handler is activated —
    /// lets a handler finish wiring itself up on the reactor thread, since
    /// construction may have happened on any thread but registration with
    /// the poller must happen on the reactor (spec §4.4).
    Init,
    Timer,
    Readiness(crate::epoll::Ready),
    Posted,
}

/// What a resource is bound to inside the reactor's tables.
#[derive(Clone, Copy)]
pub(crate) enum HandlerKind {
    Device { token: Token, fd: RawFd },
    Timer,
}

pub(crate) type Callback = Box<dyn FnMut(&mut crate::reactor::ReactorContext, ReactorEvent)>;

pub(crate) struct HandlerSlot {
    pub generation: u64,
    pub owner: ObjectId,
    pub registered: bool,
    pub active: bool,
    pub kind: Option<HandlerKind>,
    pub callback: Callback,
}

fn noop_callback() -> Callback {
    Box::new(|_ctx, _event| {})
}

impl HandlerSlot {
    pub fn new(owner: ObjectId) -> HandlerSlot {
        HandlerSlot {
            generation: 0,
            owner,
            registered: true,
            active: false,
            kind: None,
            callback: noop_callback(),
        }
    }

    /// Resets a tombstoned slot for reuse by a new handler, bumping its
    /// generation so `HandlerId`s minted before the previous occupant was
    /// unregistered can never again match. Mirrors
    /// [`crate::object::ObjectTable`]'s free-list reuse, layered on top of
    /// `slab::Slab` since slab's own index reuse carries no generation.
    pub(crate) fn reuse(&mut self, owner: ObjectId) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.owner = owner;
        self.registered = true;
        self.active = false;
        self.kind = None;
        self.callback = noop_callback();
        self.generation
    }

    pub(crate) fn tombstone(&mut self) {
        self.registered = false;
        self.active = false;
        self.kind = None;
        self.callback = noop_callback();
    }
}

/// Errors specific to handler lifecycle transitions, folded into the
/// crate-wide [`Error`] enum at the call site.
pub(crate) fn not_registered() -> Error {
    Error::Canceled
}
