//! The event queue: a superdense-time-ordered multimap from [`QueueHandle`]
//! to pending events. Every variable, zero-crossing, and
//! conditional owns at most one live handle at a time; advancing a
//! variable reschedules its handle rather than inserting a new one, which
//! is what keeps the queue's size bounded by the model size.
//!
//! Implementation: a binary heap ordered by `(SuperdenseTime, insertion
//! sequence)` gives O(log n) insert/pop, paired with a `HashMap` of
//! current handle state so `reschedule`/`erase` are also O(log n) — the
//! stale heap entry left behind by a reschedule or erase is discarded
//! lazily the next time it would surface at the top (invariant I3: a
//! handle's heap entries are never visible once superseded or erased).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

pub use qss_time::{EntityId, EventKind, EventRecord, QueueHandle, SuperdenseTime};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    sdt: SuperdenseTime,
    seq: u64,
    handle: QueueHandle,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sdt, self.seq).cmp(&(other.sdt, other.seq))
    }
}

struct EntryMeta {
    kind: EventKind,
    sdt: SuperdenseTime,
    seq: u64,
}

/// The queue. `QueueHandle`s are stable identities: a variable holds onto
/// its handle across many `reschedule` calls over the life of a
/// simulation, never re-inserting.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    entries: HashMap<QueueHandle, EntryMeta>,
    next_handle: u64,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new event, returning the handle the caller must retain to
    /// reschedule or erase it later.
    pub fn insert(&mut self, kind: EventKind, sdt: SuperdenseTime) -> QueueHandle {
        let handle = QueueHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(handle, EntryMeta { kind, sdt, seq });
        self.heap.push(Reverse(HeapEntry { sdt, seq, handle }));
        handle
    }

    /// Move an existing handle to a new time, keeping its `EventKind`.
    /// Returns the handle's previous time, or `None` if the handle is not
    /// currently live (already popped or erased).
    pub fn reschedule(&mut self, handle: QueueHandle, sdt: SuperdenseTime) -> Option<SuperdenseTime> {
        let meta = self.entries.get_mut(&handle)?;
        let previous = meta.sdt;
        meta.sdt = sdt;
        meta.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(HeapEntry { sdt, seq: meta.seq, handle }));
        Some(previous)
    }

    /// Remove a handle without ever firing it. Returns `true` if it was live.
    pub fn erase(&mut self, handle: QueueHandle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    fn clean_top(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            match self.entries.get(&top.handle) {
                Some(meta) if meta.seq == top.seq => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// The time of the next event to fire, without removing it.
    pub fn peek_time(&mut self) -> Option<SuperdenseTime> {
        self.clean_top();
        self.heap.peek().map(|Reverse(e)| e.sdt)
    }

    /// Remove and return the single earliest event.
    pub fn pop_top(&mut self) -> Option<EventRecord> {
        self.clean_top();
        let Reverse(top) = self.heap.pop()?;
        let meta = self.entries.remove(&top.handle)?;
        Some(EventRecord { kind: meta.kind, sdt: meta.sdt, handle: top.handle })
    }

    /// Remove and return every event exactly at the current earliest
    /// superdense time (the "all simultaneous events" batch the bucket
    /// pipeline and bin optimizer both consume).
    pub fn pop_all_at_top(&mut self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let Some(top_time) = self.peek_time() else { return out };
        while self.peek_time() == Some(top_time) {
            out.push(self.pop_top().expect("peeked time implies a live top entry"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdt(t: f64, s: u32) -> SuperdenseTime {
        SuperdenseTime::new(t, s)
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = EventQueue::new();
        q.insert(EventKind::Discrete(EntityId(0)), sdt(3.0, 0));
        q.insert(EventKind::Discrete(EntityId(1)), sdt(1.0, 0));
        q.insert(EventKind::Discrete(EntityId(2)), sdt(2.0, 0));
        let times: Vec<f64> = std::iter::from_fn(|| q.pop_top()).map(|e| e.sdt.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn tie_breaks_by_micro_step_then_insertion_order() {
        let mut q = EventQueue::new();
        let a = q.insert(EventKind::Discrete(EntityId(0)), sdt(1.0, 1));
        let b = q.insert(EventKind::Discrete(EntityId(1)), sdt(1.0, 0));
        let c = q.insert(EventKind::Discrete(EntityId(2)), sdt(1.0, 0));
        let order: Vec<QueueHandle> = std::iter::from_fn(|| q.pop_top()).map(|e| e.handle).collect();
        // step 0 events fire before step 1, and among equal steps insertion order wins.
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn reschedule_moves_an_event_and_drops_the_stale_entry() {
        let mut q = EventQueue::new();
        let h = q.insert(EventKind::Discrete(EntityId(0)), sdt(5.0, 0));
        q.insert(EventKind::Discrete(EntityId(1)), sdt(1.0, 0));
        let prev = q.reschedule(h, sdt(0.5, 0));
        assert_eq!(prev, Some(sdt(5.0, 0)));
        let first = q.pop_top().unwrap();
        assert_eq!(first.handle, h);
        assert_eq!(first.sdt, sdt(0.5, 0));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn erase_removes_without_firing() {
        let mut q = EventQueue::new();
        let h = q.insert(EventKind::Discrete(EntityId(0)), sdt(1.0, 0));
        assert!(q.erase(h));
        assert!(!q.erase(h));
        assert!(q.pop_top().is_none());
    }

    #[test]
    fn pop_all_at_top_groups_exact_simultaneous_events() {
        let mut q = EventQueue::new();
        q.insert(EventKind::Discrete(EntityId(0)), sdt(1.0, 0));
        q.insert(EventKind::Discrete(EntityId(1)), sdt(1.0, 0));
        q.insert(EventKind::Discrete(EntityId(2)), sdt(2.0, 0));
        let batch = q.pop_all_at_top();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.sdt == sdt(1.0, 0)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn empty_queue_peek_and_pop_are_none() {
        let mut q = EventQueue::new();
        assert_eq!(q.peek_time(), None);
        assert!(q.pop_top().is_none());
        assert!(q.pop_all_at_top().is_empty());
    }
}
