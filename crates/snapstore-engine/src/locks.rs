//! Per-chunk read locks
//!
//! Snapshot clients reading a chunk straight from the origin hold a
//! lock on it until they send a finish message; an origin write to a
//! locked chunk must not be acknowledged until every reader has let
//! go. Locks are advisory bookkeeping inside the server, not disk
//! state: a client that disconnects drops all of its holds.
//!
//! A deferred reply is a [`Pending`]: the encoded response plus a count
//! of the chunks it is still waiting on. When the count reaches zero
//! the reply is released to the writer task.

use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Server-assigned connection identifier.
pub type ClientId = u64;

/// A reply held back until some set of chunk locks clears.
pub struct Pending {
    client: ClientId,
    message: Bytes,
    holds: usize,
}

/// Shared handle to a deferred reply.
pub type PendingRef = Rc<RefCell<Pending>>;

impl Pending {
    /// New deferred reply with one hold, dropped by the caller once
    /// every lock has been consulted.
    #[must_use]
    pub fn new(client: ClientId) -> PendingRef {
        Rc::new(RefCell::new(Self {
            client,
            message: Bytes::new(),
            holds: 1,
        }))
    }

    pub fn set_message(&mut self, message: Bytes) {
        self.message = message;
    }

    #[must_use]
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn add_hold(&mut self) {
        self.holds += 1;
    }

    /// Drop one hold; true once none remain.
    pub fn release_one(&mut self) -> bool {
        self.holds -= 1;
        self.holds == 0
    }
}

struct ChunkLock {
    // one entry per outstanding read, so the same client may appear
    // more than once
    holders: Vec<ClientId>,
    waiters: Vec<PendingRef>,
}

/// All currently locked chunks.
#[derive(Default)]
pub struct LockTable {
    locks: HashMap<u64, ChunkLock>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Record a read hold on a chunk.
    pub fn hold(&mut self, chunk: u64, client: ClientId) {
        self.locks
            .entry(chunk)
            .or_insert_with(|| ChunkLock {
                holders: Vec::new(),
                waiters: Vec::new(),
            })
            .holders
            .push(client);
    }

    /// Queue a deferred reply behind a chunk's readers. Returns true
    /// and takes a hold only if the chunk is actually locked.
    pub fn wait_for(&mut self, chunk: u64, pending: &PendingRef) -> bool {
        match self.locks.get_mut(&chunk) {
            Some(lock) if !lock.holders.is_empty() => {
                debug!(chunk, readers = lock.holders.len(), "write waits on readers");
                pending.borrow_mut().add_hold();
                lock.waiters.push(Rc::clone(pending));
                true
            }
            _ => false,
        }
    }

    /// Drop one read hold on a chunk. When the last holder goes, every
    /// queued reply loses a hold; replies that become ready are
    /// returned for sending.
    pub fn release(&mut self, chunk: u64, client: ClientId) -> Vec<(ClientId, Bytes)> {
        let mut ready = Vec::new();
        let Some(lock) = self.locks.get_mut(&chunk) else {
            return ready;
        };
        if let Some(pos) = lock.holders.iter().position(|&c| c == client) {
            lock.holders.swap_remove(pos);
        }
        if lock.holders.is_empty() {
            for pending in lock.waiters.drain(..) {
                let mut p = pending.borrow_mut();
                if p.release_one() {
                    ready.push((p.client(), std::mem::take(&mut p.message)));
                }
            }
            self.locks.remove(&chunk);
        }
        ready
    }

    /// Drop every hold and queued reply belonging to a client, as on
    /// disconnect. Replies from other clients that become ready are
    /// returned.
    pub fn release_client(&mut self, client: ClientId) -> Vec<(ClientId, Bytes)> {
        let mut ready = Vec::new();
        self.locks.retain(|chunk, lock| {
            lock.holders.retain(|&c| c != client);
            lock.waiters.retain(|p| p.borrow().client() != client);
            if lock.holders.is_empty() {
                if !lock.waiters.is_empty() {
                    debug!(chunk, "releasing lock of departed client");
                }
                for pending in lock.waiters.drain(..) {
                    let mut p = pending.borrow_mut();
                    if p.release_one() {
                        ready.push((p.client(), std::mem::take(&mut p.message)));
                    }
                }
                false
            } else {
                true
            }
        });
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_only_when_held() {
        let mut locks = LockTable::new();
        let pending = Pending::new(1);
        assert!(!locks.wait_for(5, &pending));

        locks.hold(5, 2);
        assert!(locks.wait_for(5, &pending));
    }

    #[test]
    fn test_ready_after_last_holder() {
        let mut locks = LockTable::new();
        locks.hold(5, 2);
        locks.hold(5, 3);

        let pending = Pending::new(1);
        assert!(locks.wait_for(5, &pending));
        pending.borrow_mut().set_message(Bytes::from_static(b"ok"));
        // caller's own hold comes off once dispatch is finished
        assert!(!pending.borrow_mut().release_one());

        assert!(locks.release(5, 2).is_empty());
        let ready = locks.release(5, 3);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0], (1, Bytes::from_static(b"ok")));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_reply_waits_on_multiple_chunks() {
        let mut locks = LockTable::new();
        locks.hold(5, 2);
        locks.hold(9, 3);

        let pending = Pending::new(1);
        assert!(locks.wait_for(5, &pending));
        assert!(locks.wait_for(9, &pending));
        pending.borrow_mut().release_one();

        assert!(locks.release(5, 2).is_empty());
        let ready = locks.release(9, 3);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_duplicate_holds_by_one_client() {
        let mut locks = LockTable::new();
        locks.hold(5, 2);
        locks.hold(5, 2);

        let pending = Pending::new(1);
        locks.wait_for(5, &pending);
        pending.borrow_mut().release_one();

        assert!(locks.release(5, 2).is_empty());
        assert_eq!(locks.release(5, 2).len(), 1);
    }

    #[test]
    fn test_release_client_sweeps_holds() {
        let mut locks = LockTable::new();
        locks.hold(5, 2);
        locks.hold(9, 2);
        locks.hold(9, 3);

        let pending = Pending::new(1);
        locks.wait_for(5, &pending);
        locks.wait_for(9, &pending);
        pending.borrow_mut().release_one();

        // client 2 vanishes: chunk 5 clears entirely, chunk 9 still
        // has a reader
        let ready = locks.release_client(2);
        assert!(ready.is_empty());
        assert!(!locks.is_empty());

        let ready = locks.release(9, 3);
        assert_eq!(ready.len(), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_release_client_drops_own_waiters() {
        let mut locks = LockTable::new();
        locks.hold(5, 2);

        let pending = Pending::new(1);
        locks.wait_for(5, &pending);
        pending.borrow_mut().release_one();

        // the waiting writer disconnects before the reader finishes
        assert!(locks.release_client(1).is_empty());
        assert!(locks.release(5, 2).is_empty());
    }
}
