//! Waitable reply slots for manager conversations.
//!
//! A locate caller allocates a slot, sends its request tagged with the
//! slot's message id, and parks until the manager's reply line arrives or
//! the wait expires. The id folds a generation counter over the slot index
//! so a late reply to a recycled slot never resolves.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

/// Number of reply slots; the low byte of a message id is the slot index.
const NUM_SLOTS: usize = 256;

struct MsgState {
    id: u32,
    busy: bool,
    reply: Option<String>,
}

struct MsgSlot {
    state: Mutex<MsgState>,
    arrived: Condvar,
}

/// Table of in-flight request slots.
pub struct MsgTable {
    slots: Vec<MsgSlot>,
    next_gen: Mutex<u32>,
}

impl Default for MsgTable {
    fn default() -> Self {
        MsgTable {
            slots: (0..NUM_SLOTS)
                .map(|_| MsgSlot {
                    state: Mutex::new(MsgState {
                        id: 0,
                        busy: false,
                        reply: None,
                    }),
                    arrived: Condvar::new(),
                })
                .collect(),
            next_gen: Mutex::new(0),
        }
    }
}

impl MsgTable {
    /// An empty table.
    pub fn new() -> Arc<MsgTable> {
        Arc::new(MsgTable::default())
    }

    /// Claim a slot; `None` when all are in flight (the caller should
    /// answer "busy" rather than block).
    pub fn alloc(self: &Arc<Self>) -> Option<MsgHandle> {
        let generation = {
            let mut g = self.next_gen.lock();
            *g = g.wrapping_add(1).max(1);
            *g
        };
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut state = slot.state.lock();
            if !state.busy {
                let id = generation.wrapping_mul(NUM_SLOTS as u32) | idx as u32;
                state.busy = true;
                state.id = id;
                state.reply = None;
                return Some(MsgHandle {
                    table: self.clone(),
                    idx,
                    id,
                });
            }
        }
        None
    }

    /// Deliver a reply line for `id`. Returns false when the slot has been
    /// recycled (a stale reply, silently dropped by the caller).
    pub fn reply(&self, id: u32, text: &str) -> bool {
        let idx = (id as usize) % NUM_SLOTS;
        let slot = &self.slots[idx];
        let mut state = slot.state.lock();
        if !state.busy || state.id != id {
            debug!("msg: reply to stale id {id}");
            return false;
        }
        state.reply = Some(text.to_owned());
        slot.arrived.notify_all();
        true
    }
}

impl std::fmt::Debug for MsgTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgTable({NUM_SLOTS} slots)")
    }
}

/// An allocated reply slot; frees itself on drop.
pub struct MsgHandle {
    table: Arc<MsgTable>,
    idx: usize,
    id: u32,
}

impl MsgHandle {
    /// The id to put on the wire.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until the reply arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<String> {
        let slot = &self.table.slots[self.idx];
        let mut state = slot.state.lock();
        if state.reply.is_none() {
            slot.arrived.wait_for(&mut state, timeout);
        }
        state.reply.take()
    }
}

impl Drop for MsgHandle {
    fn drop(&mut self) {
        let slot = &self.table.slots[self.idx];
        let mut state = slot.state.lock();
        if state.id == self.id {
            state.busy = false;
            state.reply = None;
        }
    }
}

impl std::fmt::Debug for MsgHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgHandle({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reply_wakes_waiter() {
        let table = MsgTable::new();
        let h = table.alloc().unwrap();
        let id = h.id();
        let t2 = table.clone();
        let replier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            assert!(t2.reply(id, "!try host:1094"));
        });
        let reply = h.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(reply, "!try host:1094");
        replier.join().unwrap();
    }

    #[test]
    fn timeout_returns_none() {
        let table = MsgTable::new();
        let h = table.alloc().unwrap();
        assert!(h.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn stale_reply_rejected() {
        let table = MsgTable::new();
        let id = {
            let h = table.alloc().unwrap();
            h.id()
        };
        // The handle is gone; its slot is free and the id stale.
        assert!(!table.reply(id, "!wait 5"));
    }

    #[test]
    fn recycled_slot_gets_new_id() {
        let table = MsgTable::new();
        let first = table.alloc().unwrap().id();
        let second = table.alloc().unwrap().id();
        assert_ne!(first, second);
    }
}
