//! `Object`: a long-lived logical participant — one connection, one
//! listener, one timer-driven task. Identified by a `(slot, generation)`
//! pair so a reference taken before an `unregister` can never be confused
//! with whatever gets registered into the same slot afterward.

use smallvec::SmallVec;

use crate::handler::HandlerId;

/// A checked reference to a registered [`Object`].
///
/// The generation is bumped every time the slot is freed, which is enough
/// to satisfy the spec's generation-drop law: posting to a stale id after
/// `unregister` is dropped even if a new object has since taken the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub slot: usize,
    pub generation: u64,
}

/// A posted event waiting in an Object's mailbox, or in flight on the
/// posted-event queue on its way to one.
pub struct PostedEvent {
    pub handler: HandlerId,
    pub event: crate::handler::ReactorEvent,
}

pub(crate) struct ObjectSlot {
    pub generation: u64,
    pub occupied: bool,
    /// Almost every object (a Stream, Listener, Datagram or Timer) registers
    /// exactly one handler; inline capacity for 4 avoids a heap allocation
    /// for the common case while still growing for objects that bind more.
    pub handlers: SmallVec<[HandlerId; 4]>,
}

/// Hand-rolled generational slot table for Objects.
///
/// Unlike the handler table (which uses the `slab` crate — see DESIGN.md),
/// the object table is rolled by hand: it needs to keep a *dead* slot's
/// generation counter alive after removal (to reject stale `ObjectId`s),
/// which is exactly what `slab::Slab` does not do once an entry is
/// removed and the slot is reused without any generation tracking.
pub(crate) struct ObjectTable {
    slots: Vec<ObjectSlot>,
    free: Vec<usize>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        ObjectTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self) -> ObjectId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot];
            entry.occupied = true;
            entry.handlers.clear();
            ObjectId {
                slot,
                generation: entry.generation,
            }
        } else {
            let slot = self.slots.len();
            self.slots.push(ObjectSlot {
                generation: 1,
                occupied: true,
                handlers: SmallVec::new(),
            });
            ObjectId { slot, generation: 1 }
        }
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        match self.slots.get_mut(id.slot) {
            Some(entry) if entry.occupied && entry.generation == id.generation => {
                entry.occupied = false;
                entry.generation = entry.generation.wrapping_add(1);
                entry.handlers.clear();
                self.free.push(id.slot);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        matches!(self.slots.get(id.slot), Some(entry) if entry.occupied && entry.generation == id.generation)
    }

    pub fn add_handler(&mut self, id: ObjectId, handler: HandlerId) {
        if let Some(entry) = self.slots.get_mut(id.slot) {
            if entry.occupied && entry.generation == id.generation {
                entry.handlers.push(handler);
            }
        }
    }

    pub fn remove_handler(&mut self, id: ObjectId, handler: HandlerId) {
        if let Some(entry) = self.slots.get_mut(id.slot) {
            if entry.occupied && entry.generation == id.generation {
                entry.handlers.retain(|h| *h != handler);
            }
        }
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        ObjectTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unregister_then_register_bumps_generation_and_drops_stale_id() {
        let mut table = ObjectTable::new();
        let o = table.insert();
        assert_eq!(o, ObjectId { slot: 0, generation: 1 });

        assert!(table.remove(o));
        assert!(!table.contains(o));

        let o2 = table.insert();
        assert_eq!(o2, ObjectId { slot: 0, generation: 2 });
        assert!(!table.contains(o));
        assert!(table.contains(o2));
    }

    #[test]
    fn double_remove_is_rejected() {
        let mut table = ObjectTable::new();
        let o = table.insert();
        assert!(table.remove(o));
        assert!(!table.remove(o));
    }
}
