//! The shared state registry — lifecycle bookkeeping for every exploration
//! state in a run.
//!
//! Each state id lives in exactly one of four lists:
//!
//! ```text
//!             ┌────────────┐  get_state  ┌──────────┐
//!   seed ───> │   ready    +────────────>+   busy   |
//!   fork ───> │            +<────────────+          |
//!             └────────────┘   revive    └─+──+──+──┘
//!                                 terminate |  |  | discard
//!                              ┌────────────┘  |  └───> (destroyed)
//!                              v                v
//!                        ┌──────────┐     ┌────────┐
//!                        │terminated│     │ killed │
//!                        └──────────┘     └────────┘
//! ```
//!
//! `terminated` and `killed` are immutable end states, kept for harvesting
//! and reporting. A fork parent that has been consumed by its successors is
//! *destroyed*: its payload is dropped but a descriptor tombstone survives
//! so introspection can still account for the id.
//!
//! All access goes through one mutex/condvar pair owned by the registry.
//! `get_state` is the single-owner guarantee the whole pool depends on: two
//! concurrent calls can never hand out the same id, because the ready→busy
//! move happens under the lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::cancel::CancelToken;

/// Registry-assigned identifier of an exploration state, unique for the
/// lifetime of a run.
pub type StateId = u64;

/// Which list an id currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateList {
    /// Waiting for an execution unit.
    Ready,
    /// Owned by exactly one execution unit.
    Busy,
    /// Reached an end-of-path condition; never re-scheduled.
    Terminated,
    /// Retired by an unrecoverable failure; never re-scheduled.
    Killed,
    /// Fork parent consumed by its successors; payload dropped, descriptor
    /// kept as a tombstone.
    Destroyed,
}

/// Scheduler-tracked attributes of one state, as copied out by
/// [`StateRegistry::introspect`].
#[derive(Debug, Clone)]
pub struct StateDescriptor {
    pub id: StateId,
    pub list: StateList,
    /// How many times a unit has taken ownership of this id.
    pub execs: u64,
    /// Termination reason, set once the state is terminated or killed.
    pub reason: Option<String>,
    /// When the state last changed lists.
    pub list_changed_at: Instant,
}

/// Sizes of the four public lists, for logging and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ListCounts {
    pub ready: usize,
    pub busy: usize,
    pub terminated: usize,
    pub killed: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown state id {0}")]
    UnknownState(StateId),

    #[error("state {0} was destroyed by a fork")]
    Destroyed(StateId),

    #[error("state {0} is not in the busy list")]
    NotBusy(StateId),
}

struct StateRecord<S> {
    /// Checkpoint copy of the state; `None` once destroyed.
    payload: Option<S>,
    desc: StateDescriptor,
}

struct Inner<S> {
    ready: BTreeSet<StateId>,
    busy: BTreeSet<StateId>,
    terminated: BTreeSet<StateId>,
    killed: BTreeSet<StateId>,
    records: HashMap<StateId, StateRecord<S>>,
    next_id: StateId,
}

impl<S> Inner<S> {
    /// Pull `id` out of the busy list or say why it can't be.
    fn take_from_busy(&mut self, id: StateId) -> Result<(), RegistryError> {
        if self.busy.remove(&id) {
            Ok(())
        } else if self.records.contains_key(&id) {
            Err(RegistryError::NotBusy(id))
        } else {
            Err(RegistryError::UnknownState(id))
        }
    }

    fn insert(&mut self, payload: S, list: StateList, execs: u64) -> StateId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(
            id,
            StateRecord {
                payload: Some(payload),
                desc: StateDescriptor {
                    id,
                    list,
                    execs,
                    reason: None,
                    list_changed_at: Instant::now(),
                },
            },
        );
        id
    }

    fn retag(&mut self, id: StateId, list: StateList, reason: Option<&str>) {
        let desc = &mut self.records.get_mut(&id).unwrap().desc;
        desc.list = list;
        desc.list_changed_at = Instant::now();
        if let Some(reason) = reason {
            desc.reason = Some(reason.to_string());
        }
    }
}

/// Thread-shared store of exploration states partitioned into the four
/// lifecycle lists.
///
/// The registry always holds its own checkpoint copy of every live payload:
/// `get_state` clones the payload out and `save` clones it back in. That is
/// what makes cooperative-stop checkpointing sound — a revived id re-enters
/// `ready` exactly as last saved, whatever the unit did to its working copy
/// since.
pub struct StateRegistry<S> {
    inner: Mutex<Inner<S>>,
    cond: Condvar,
    cancel: CancelToken,
}

impl<S: Clone> StateRegistry<S> {
    /// A fresh registry observing the given kill flag.
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: BTreeSet::new(),
                busy: BTreeSet::new(),
                terminated: BTreeSet::new(),
                killed: BTreeSet::new(),
                records: HashMap::new(),
                next_id: 0,
            }),
            cond: Condvar::new(),
            cancel,
        }
    }

    /// Atomically move one id from `ready` to `busy` and return a clone of
    /// its payload, bumping its execution counter.
    ///
    /// With `wait` set, blocks until a state shows up, exploration is
    /// exhausted (`ready` and `busy` both empty — nothing left that could
    /// fork), or the kill flag is set; the latter two return `None`. The
    /// lowest id is picked first, which keeps tests deterministic but is
    /// not part of the contract.
    pub fn get_state(&self, wait: bool) -> Option<(StateId, S)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(id) = inner.ready.first().copied() {
                inner.ready.remove(&id);
                inner.busy.insert(id);
                let rec = inner.records.get_mut(&id).unwrap();
                rec.desc.list = StateList::Busy;
                rec.desc.list_changed_at = Instant::now();
                rec.desc.execs += 1;
                let payload = rec.payload.clone().unwrap();
                return Some((id, payload));
            }
            if !wait || inner.busy.is_empty() {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Admit a new state into `ready` under a fresh id and wake any blocked
    /// acquirers. Used at seeding and for fork successors.
    pub fn put_ready(&self, state: &S) -> StateId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.insert(state.clone(), StateList::Ready, 0);
        inner.ready.insert(id);
        self.cond.notify_all();
        id
    }

    /// Admit a new state directly into `busy` under a fresh id, with one
    /// ownership already counted. This is the fork keep-going path: the
    /// calling unit already owns the working copy and continues driving it
    /// without a registry round trip.
    pub fn put_busy(&self, state: &S) -> StateId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.insert(state.clone(), StateList::Busy, 1);
        inner.busy.insert(id);
        self.cond.notify_all();
        id
    }

    /// Overwrite the checkpoint copy of `id` without touching its list
    /// membership. Idempotent; callable any number of times.
    pub fn save(&self, id: StateId, state: &S) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .records
            .get_mut(&id)
            .ok_or(RegistryError::UnknownState(id))?;
        if rec.payload.is_none() {
            return Err(RegistryError::Destroyed(id));
        }
        rec.payload = Some(state.clone());
        Ok(())
    }

    /// Move `id` from `busy` back to `ready`, unmodified. Used only for
    /// cooperative-stop checkpointing; calling it on an id that is not busy
    /// is a contract violation.
    pub fn revive(&self, id: StateId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_from_busy(id)?;
        inner.ready.insert(id);
        inner.retag(id, StateList::Ready, None);
        self.cond.notify_all();
        Ok(())
    }

    /// Move `id` from `busy` to `terminated`, recording the reason.
    /// Terminal and irreversible.
    pub fn terminate(&self, id: StateId, reason: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_from_busy(id)?;
        inner.terminated.insert(id);
        inner.retag(id, StateList::Terminated, Some(reason));
        self.cond.notify_all();
        Ok(())
    }

    /// Move `id` from `busy` to `killed`, recording the failure. Terminal
    /// and irreversible.
    pub fn kill(&self, id: StateId, reason: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_from_busy(id)?;
        inner.killed.insert(id);
        inner.retag(id, StateList::Killed, Some(reason));
        self.cond.notify_all();
        Ok(())
    }

    /// Drop a consumed fork parent: the payload is freed, the descriptor
    /// stays behind as a destroyed tombstone.
    pub fn discard(&self, id: StateId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_from_busy(id)?;
        let rec = inner.records.get_mut(&id).unwrap();
        rec.payload = None;
        rec.desc.list = StateList::Destroyed;
        rec.desc.list_changed_at = Instant::now();
        self.cond.notify_all();
        Ok(())
    }

    /// Point-in-time copy of every tracked descriptor, destroyed tombstones
    /// included. The lock is held only for the copy, never while a caller
    /// serializes the result.
    pub fn introspect(&self) -> HashMap<StateId, StateDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(id, rec)| (*id, rec.desc.clone()))
            .collect()
    }

    /// Current sizes of the four lists.
    pub fn counts(&self) -> ListCounts {
        let inner = self.inner.lock().unwrap();
        ListCounts {
            ready: inner.ready.len(),
            busy: inner.busy.len(),
            terminated: inner.terminated.len(),
            killed: inner.killed.len(),
        }
    }

    /// Wake every blocked `get_state` caller so it can re-check the kill
    /// flag. Setting the flag does not wake waiters by itself; callers that
    /// cancel must follow up with this (as `Engine::kill` does).
    pub fn wake_all(&self) {
        let _inner = self.inner.lock().unwrap();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn registry() -> StateRegistry<String> {
        StateRegistry::new(CancelToken::new())
    }

    #[test]
    fn get_state_moves_ready_to_busy() {
        let reg = registry();
        let id = reg.put_ready(&"s0".to_string());

        let (got, payload) = reg.get_state(false).unwrap();
        assert_eq!(got, id);
        assert_eq!(payload, "s0");

        let counts = reg.counts();
        assert_eq!(counts.ready, 0);
        assert_eq!(counts.busy, 1);
    }

    #[test]
    fn get_state_without_wait_returns_none_when_empty() {
        let reg = registry();
        assert!(reg.get_state(false).is_none());
    }

    #[test]
    fn get_state_reports_exhaustion() {
        // ready and busy both empty: waiting would never succeed.
        let reg = registry();
        assert!(reg.get_state(true).is_none());
    }

    #[test]
    fn every_id_lives_in_exactly_one_list() {
        let reg = registry();
        let a = reg.put_ready(&"a".to_string());
        let b = reg.put_ready(&"b".to_string());
        let c = reg.put_ready(&"c".to_string());
        let d = reg.put_ready(&"d".to_string());

        // All four go busy, then: a revived, b left busy, c terminated,
        // d killed.
        for _ in 0..4 {
            reg.get_state(false).unwrap();
        }
        reg.terminate(c, "done").unwrap();
        reg.kill(d, "boom").unwrap();
        reg.revive(a).unwrap();

        let lists: Vec<(StateId, StateList)> = reg
            .introspect()
            .into_iter()
            .map(|(id, desc)| (id, desc.list))
            .collect();
        assert_eq!(lists.len(), 4);
        for (id, list) in lists {
            let expected = match id {
                x if x == a => StateList::Ready,
                x if x == b => StateList::Busy,
                x if x == c => StateList::Terminated,
                x if x == d => StateList::Killed,
                other => panic!("unexpected id {other}"),
            };
            assert_eq!(list, expected, "id {id}");
        }

        let counts = reg.counts();
        assert_eq!(
            (counts.ready, counts.busy, counts.terminated, counts.killed),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn concurrent_get_state_never_hands_out_the_same_id() {
        let reg = Arc::new(registry());
        for i in 0..100 {
            reg.put_ready(&format!("s{i}"));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some((id, _)) = reg.get_state(false) {
                    taken.push(id);
                }
                taken
            }));
        }

        let mut all: Vec<StateId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before, "an id was handed out twice");
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn waiter_wakes_when_a_state_arrives() {
        let reg = Arc::new(registry());
        // One busy state keeps the waiter from concluding exhaustion.
        reg.put_ready(&"pinned".to_string());
        reg.get_state(false).unwrap();

        let waiter = {
            let reg = reg.clone();
            thread::spawn(move || reg.get_state(true))
        };

        thread::sleep(Duration::from_millis(50));
        let id = reg.put_ready(&"late".to_string());

        let got = waiter.join().unwrap().expect("waiter should get a state");
        assert_eq!(got.0, id);
        assert_eq!(got.1, "late");
    }

    #[test]
    fn waiter_wakes_on_exhaustion() {
        let reg = Arc::new(registry());
        reg.put_ready(&"only".to_string());
        let (id, _) = reg.get_state(false).unwrap();

        let waiter = {
            let reg = reg.clone();
            thread::spawn(move || reg.get_state(true))
        };

        // Terminating the last busy state leaves nothing that could fork,
        // so the blocked waiter must wake and report exhaustion.
        thread::sleep(Duration::from_millis(50));
        reg.terminate(id, "done").unwrap();

        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn cancelled_registry_stops_handing_out_states() {
        let cancel = CancelToken::new();
        let reg: StateRegistry<String> = StateRegistry::new(cancel.clone());
        reg.put_ready(&"never picked up".to_string());

        cancel.cancel();
        assert!(reg.get_state(true).is_none());
        assert_eq!(reg.counts().ready, 1);
    }

    #[test]
    fn kill_flag_wakes_blocked_waiter() {
        let cancel = CancelToken::new();
        let reg: Arc<StateRegistry<String>> = Arc::new(StateRegistry::new(cancel.clone()));
        reg.put_ready(&"pinned".to_string());
        reg.get_state(false).unwrap();

        let waiter = {
            let reg = reg.clone();
            thread::spawn(move || reg.get_state(true))
        };

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        reg.wake_all();

        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn revive_requires_busy() {
        let reg = registry();
        let id = reg.put_ready(&"s".to_string());

        assert_eq!(reg.revive(id), Err(RegistryError::NotBusy(id)));
        assert_eq!(reg.revive(999), Err(RegistryError::UnknownState(999)));

        reg.get_state(false).unwrap();
        reg.revive(id).unwrap();
        assert_eq!(reg.counts().ready, 1);
        assert_eq!(reg.counts().busy, 0);
    }

    #[test]
    fn save_then_revive_resumes_the_checkpoint() {
        let reg = registry();
        let id = reg.put_ready(&"v1".to_string());

        let (_, payload) = reg.get_state(false).unwrap();
        assert_eq!(payload, "v1");

        // Unit checkpoints its progress, then puts the state back.
        reg.save(id, &"v2".to_string()).unwrap();
        reg.revive(id).unwrap();

        let (got, payload) = reg.get_state(false).unwrap();
        assert_eq!(got, id);
        assert_eq!(payload, "v2");
    }

    #[test]
    fn save_rejects_unknown_and_destroyed_ids() {
        let reg = registry();
        assert_eq!(
            reg.save(7, &"x".to_string()),
            Err(RegistryError::UnknownState(7))
        );

        let id = reg.put_ready(&"parent".to_string());
        reg.get_state(false).unwrap();
        reg.discard(id).unwrap();
        assert_eq!(
            reg.save(id, &"x".to_string()),
            Err(RegistryError::Destroyed(id))
        );
    }

    #[test]
    fn terminate_records_the_reason() {
        let reg = registry();
        let id = reg.put_ready(&"s".to_string());
        reg.get_state(false).unwrap();
        reg.terminate(id, "path exhausted").unwrap();

        let desc = reg.introspect().remove(&id).unwrap();
        assert_eq!(desc.list, StateList::Terminated);
        assert_eq!(desc.reason.as_deref(), Some("path exhausted"));
        assert_eq!(desc.execs, 1);

        // End states never come back.
        assert_eq!(reg.terminate(id, "again"), Err(RegistryError::NotBusy(id)));
    }

    #[test]
    fn discard_leaves_a_tombstone() {
        let reg = registry();
        let id = reg.put_ready(&"parent".to_string());
        reg.get_state(false).unwrap();
        reg.discard(id).unwrap();

        let counts = reg.counts();
        assert_eq!(
            (counts.ready, counts.busy, counts.terminated, counts.killed),
            (0, 0, 0, 0)
        );
        let desc = reg.introspect().remove(&id).unwrap();
        assert_eq!(desc.list, StateList::Destroyed);
    }

    #[test]
    fn execs_counts_ownership_transfers() {
        let reg = registry();
        let id = reg.put_ready(&"s".to_string());

        reg.get_state(false).unwrap();
        reg.revive(id).unwrap();
        reg.get_state(false).unwrap();

        assert_eq!(reg.introspect()[&id].execs, 2);

        let kept = reg.put_busy(&"child".to_string());
        assert_eq!(reg.introspect()[&kept].execs, 1);
    }

    #[test]
    fn fresh_ids_are_never_reused() {
        let reg = registry();
        let a = reg.put_ready(&"a".to_string());
        reg.get_state(false).unwrap();
        reg.discard(a).unwrap();

        let b = reg.put_ready(&"b".to_string());
        assert_ne!(a, b);
    }
}
