use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Lifecycle of a worker unit.  The split between `Close`, `Closing`
/// and `Closed` lets the supervisor tell "requested stop" from "stop in
/// progress" from "safe to reap".
///
/// Legal transitions:
///
/// *  Spawning -> Active        worker announces it is serving
/// *  Spawning|Active -> Close  supervisor (or the worker) requests stop
/// *  Close -> Closing          worker observed the request and drains
/// *  any -> Closed             worker exits
///
/// Only the worker moves a unit to `Active`, `Closing` or `Closed`.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Spawning,
    Active,
    Close,
    Closing,
    Closed,
}

/// A unit's lifecycle state behind its per-unit lock.  Shared between
/// the worker thread and the supervisor.
///
#[derive(Debug)]
pub struct UnitState {
    state: Mutex<LifecycleState>,
}

impl UnitState {
    pub fn new() -> Arc<UnitState> {
        Arc::new(UnitState {
            state: Mutex::new(LifecycleState::Spawning),
        })
    }
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }
    /// Worker announces it is serving.  A close request that raced the
    /// spawn is preserved.
    pub fn announce_active(&self) {
        let mut s = self.state.lock().unwrap();
        if *s == LifecycleState::Spawning {
            *s = LifecycleState::Active;
        }
    }
    /// Request the unit to stop.  Never demotes a unit already past
    /// `Close`.
    pub fn request_close(&self) {
        let mut s = self.state.lock().unwrap();
        if *s == LifecycleState::Spawning || *s == LifecycleState::Active {
            *s = LifecycleState::Close;
        }
    }
    /// Worker observed the close request and starts draining.
    pub fn begin_closing(&self) {
        let mut s = self.state.lock().unwrap();
        if *s != LifecycleState::Closed {
            *s = LifecycleState::Closing;
        }
    }
    /// Worker is gone; the unit may be reaped.
    pub fn mark_closed(&self) {
        *self.state.lock().unwrap() = LifecycleState::Closed;
    }
    /// True once a stop has been requested (or is underway); workers
    /// poll this between blocking operations.
    pub fn close_requested(&self) -> bool {
        !matches!(
            self.state(),
            LifecycleState::Spawning | LifecycleState::Active
        )
    }
}

/// Opaque key of a registry entry.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// One registry entry: lifecycle state, the unit's private payload and
/// its join handle.  The handle is `None` only for the short window
/// between insertion and spawn, or after a failed spawn.
///
pub struct UnitEntry<P> {
    pub unit: Arc<UnitState>,
    pub payload: P,
    pub handle: Option<thread::JoinHandle<()>>,
}

/// A catalog of units keyed by [UnitId].  The interior lock is held
/// only across map mutation and snapshotting, never while calling into
/// workers or sockets.
///
pub struct UnitTable<P> {
    entries: Mutex<HashMap<u64, UnitEntry<P>>>,
    next_id: AtomicU64,
}

impl<P> UnitTable<P> {
    pub fn new() -> UnitTable<P> {
        UnitTable {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
    /// Add a unit and return its id.
    pub fn insert(
        &self,
        payload: P,
        unit: Arc<UnitState>,
        handle: Option<thread::JoinHandle<()>>,
    ) -> UnitId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(
            id,
            UnitEntry {
                unit,
                payload,
                handle,
            },
        );
        UnitId(id)
    }
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Remove and return every entry whose unit reached `Closed`.  The
    /// caller joins the handles outside our lock.
    pub fn take_closed(&self) -> Vec<(UnitId, UnitEntry<P>)> {
        let mut entries = self.entries.lock().unwrap();
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.unit.state() == LifecycleState::Closed)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .map(|id| (UnitId(id), entries.remove(&id).unwrap()))
            .collect()
    }
    /// Remove one entry by id, if present.
    pub fn take(&self, id: UnitId) -> Option<UnitEntry<P>> {
        self.entries.lock().unwrap().remove(&id.0)
    }
    /// Ask every unit to stop.
    pub fn request_close_all(&self) {
        for entry in self.entries.lock().unwrap().values() {
            entry.unit.request_close();
        }
    }
    /// Count entries whose payload satisfies `pred`.
    pub fn count_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&P) -> bool,
    {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| pred(&e.payload))
            .count()
    }
}

impl<P: Clone> UnitTable<P> {
    /// Snapshot the live entries (id, state handle, payload clone) so
    /// the caller can iterate without holding the table lock.
    pub fn snapshot(&self) -> Vec<(UnitId, Arc<UnitState>, P)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, e)| (UnitId(*id), Arc::clone(&e.unit), e.payload.clone()))
            .collect()
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn new_1() {
        let u = UnitState::new();
        assert_eq!(LifecycleState::Spawning, u.state());
        assert!(!u.close_requested());
    }
    #[test]
    fn transitions_1() {
        let u = UnitState::new();
        u.announce_active();
        assert_eq!(LifecycleState::Active, u.state());
        u.request_close();
        assert_eq!(LifecycleState::Close, u.state());
        assert!(u.close_requested());
        u.begin_closing();
        assert_eq!(LifecycleState::Closing, u.state());
        u.mark_closed();
        assert_eq!(LifecycleState::Closed, u.state());
    }
    #[test]
    fn transitions_2() {
        // A close request that raced the spawn is not lost when the
        // worker announces itself.
        let u = UnitState::new();
        u.request_close();
        u.announce_active();
        assert_eq!(LifecycleState::Close, u.state());
    }
    #[test]
    fn transitions_3() {
        // request_close never demotes a closing or closed unit.
        let u = UnitState::new();
        u.announce_active();
        u.begin_closing();
        u.request_close();
        assert_eq!(LifecycleState::Closing, u.state());
        u.mark_closed();
        u.request_close();
        assert_eq!(LifecycleState::Closed, u.state());
    }
    #[test]
    fn transitions_4() {
        // A crashing worker goes straight to Closed from any state.
        let u = UnitState::new();
        u.announce_active();
        u.mark_closed();
        assert_eq!(LifecycleState::Closed, u.state());
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;

    #[test]
    fn insert_1() {
        let table: UnitTable<u32> = UnitTable::new();
        let a = table.insert(1, UnitState::new(), None);
        let b = table.insert(2, UnitState::new(), None);
        assert_ne!(a, b);
        assert_eq!(2, table.len());
    }
    #[test]
    fn take_closed_1() {
        let table: UnitTable<u32> = UnitTable::new();
        let ua = UnitState::new();
        let ub = UnitState::new();
        table.insert(1, Arc::clone(&ua), None);
        table.insert(2, Arc::clone(&ub), None);
        ua.mark_closed();
        let reaped = table.take_closed();
        assert_eq!(1, reaped.len());
        assert_eq!(1, reaped[0].1.payload);
        assert_eq!(1, table.len());
    }
    #[test]
    fn take_closed_2() {
        // A joinable handle comes back with the entry.
        let table: UnitTable<()> = UnitTable::new();
        let unit = UnitState::new();
        let worker_unit = Arc::clone(&unit);
        let handle = thread::spawn(move || {
            worker_unit.mark_closed();
        });
        table.insert((), unit, Some(handle));
        // Wait for the worker to finish.
        loop {
            let reaped = table.take_closed();
            if !reaped.is_empty() {
                for (_, mut entry) in reaped {
                    entry.handle.take().unwrap().join().unwrap();
                }
                break;
            }
            thread::yield_now();
        }
        assert!(table.is_empty());
    }
    #[test]
    fn close_all_1() {
        let table: UnitTable<u32> = UnitTable::new();
        let ua = UnitState::new();
        ua.announce_active();
        let ub = UnitState::new();
        ub.announce_active();
        table.insert(1, Arc::clone(&ua), None);
        table.insert(2, Arc::clone(&ub), None);
        table.request_close_all();
        assert_eq!(LifecycleState::Close, ua.state());
        assert_eq!(LifecycleState::Close, ub.state());
    }
    #[test]
    fn count_1() {
        let table: UnitTable<u32> = UnitTable::new();
        table.insert(1, UnitState::new(), None);
        table.insert(2, UnitState::new(), None);
        table.insert(2, UnitState::new(), None);
        assert_eq!(2, table.count_matching(|p| *p == 2));
    }
}
