// Priority-ordered collection of pending entries.
//
// Shared between submit paths and the send loop, so every operation locks.
// `take` pops in strictly non-increasing priority order, FIFO within one
// priority level; a concurrent `push` becomes visible either in that take or
// the next one, never torn.
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use crate::entry::BatchEntry;

pub(crate) struct PriorityQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    heap: BinaryHeap<Slot>,
    seq: u64,
}

struct Slot {
    entry: Arc<BatchEntry>,
    seq: u64,
}

impl Slot {
    fn priority(&self) -> u64 {
        self.entry.priority
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority() && self.seq == other.seq
    }
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
        }
    }

    pub(crate) fn push(&self, entry: Arc<BatchEntry>) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Slot { entry, seq });
    }

    /// Pop up to `n` entries, highest priority first.
    pub(crate) fn take(&self, n: usize) -> Vec<Arc<BatchEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let count = n.min(inner.heap.len());
        let mut taken = Vec::with_capacity(count);
        for _ in 0..count {
            match inner.heap.pop() {
                Some(slot) => taken.push(slot.entry),
                None => break,
            }
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    /// Priority of the most urgent queued entry; 0 when empty.
    pub(crate) fn highest_priority(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .heap
            .peek()
            .map(Slot::priority)
            .unwrap_or(0)
    }

    /// Snapshot of every queued entry, in no particular order.
    pub(crate) fn all(&self) -> Vec<Arc<BatchEntry>> {
        self.inner
            .lock()
            .unwrap()
            .heap
            .iter()
            .map(|slot| Arc::clone(&slot.entry))
            .collect()
    }

    /// Drop everything, releasing the entries' payload memory.
    pub(crate) fn reset(&self) {
        self.inner.lock().unwrap().heap.clear();
    }

    /// Drop cancelled entries; live ones stay queued for the next round.
    pub(crate) fn clean(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.iter().any(|slot| slot.entry.is_canceled()) {
            let kept: BinaryHeap<Slot> = inner
                .heap
                .drain()
                .filter(|slot| !slot.entry.is_canceled())
                .collect();
            inner.heap = kept;
        }
    }
}
