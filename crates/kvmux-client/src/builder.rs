// Accumulates entries and assembles wire batches under the priority rules.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use kvmux_wire::BatchRequest;

use crate::config::HIGH_TASK_PRIORITY;
use crate::entry::BatchEntry;
use crate::error::Error;
use crate::queue::PriorityQueue;

/// Builds `BatchRequest`s out of queued entries.
///
/// Request ids are allocated here but only become meaningful once the
/// `collect` callback has stored the entry in a correlation table, which is
/// why `collect` runs before the entry is routed into a batch.
pub(crate) struct BatchBuilder {
    id_alloc: u64,
    entries: PriorityQueue,
    requests: Vec<bytes::Bytes>,
    request_ids: Vec<u64>,
    // In most rounds there is no forwarded traffic.
    forwarding: HashMap<String, BatchRequest>,
    pub(crate) latest_req_start: Option<Instant>,
}

impl BatchBuilder {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            id_alloc: 0,
            entries: PriorityQueue::new(),
            requests: Vec::with_capacity(max_batch_size),
            request_ids: Vec::with_capacity(max_batch_size),
            forwarding: HashMap::new(),
            latest_req_start: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn push(&mut self, entry: Arc<BatchEntry>) {
        if self.latest_req_start.is_none_or(|latest| entry.start > latest) {
            self.latest_req_start = Some(entry.start);
        }
        self.entries.push(entry);
    }

    pub(crate) fn has_high_priority_task(&self) -> bool {
        self.entries.highest_priority() >= HIGH_TASK_PRIORITY
    }

    /// Emit batches under `limit`. High-priority entries don't consume the
    /// limit, so it only constrains normal tasks; `limit == 0` still drains
    /// high-priority work one entry at a time. The first return value is the
    /// direct batch, the second maps forwarded hosts to their batches.
    pub(crate) fn build_with_limit(
        &mut self,
        limit: i64,
        mut collect: impl FnMut(u64, &Arc<BatchEntry>),
    ) -> (Option<BatchRequest>, HashMap<String, BatchRequest>) {
        let mut count: i64 = 0;
        while (count < limit && self.entries.len() > 0) || self.has_high_priority_task() {
            let n = if limit == 0 { 1 } else { limit.max(1) as usize };
            let taken = self.entries.take(n);
            if taken.is_empty() {
                break;
            }
            for entry in taken {
                if entry.is_canceled() {
                    continue;
                }
                if !entry.is_high_priority() {
                    count += 1;
                }
                collect(self.id_alloc, &entry);
                match &entry.forwarded_host {
                    None => {
                        self.request_ids.push(self.id_alloc);
                        self.requests.push(entry.payload.clone());
                    }
                    Some(host) => {
                        let batch = self.forwarding.entry(host.clone()).or_default();
                        batch.request_ids.push(self.id_alloc);
                        batch.requests.push(entry.payload.clone());
                    }
                }
                self.id_alloc += 1;
            }
        }
        let direct = if self.requests.is_empty() {
            None
        } else {
            Some(BatchRequest {
                requests: self.requests.clone(),
                request_ids: self.request_ids.clone(),
            })
        };
        (direct, std::mem::take(&mut self.forwarding))
    }

    /// Terminate every queued entry with `err` and empty the queue. Used for
    /// shutdown in tests and for the legacy no-available-connections path.
    pub(crate) fn cancel(&mut self, err: &Error) {
        for entry in self.entries.all() {
            entry.fail(err.clone());
        }
        self.entries.reset();
    }

    /// Prepare for the next round. Cancelled entries are dropped; live ones
    /// stay queued. Clearing the batch vectors releases the payload handles
    /// so callers' backing memory is not pinned by a stale round.
    pub(crate) fn reset(&mut self) {
        self.entries.clean();
        self.requests.clear();
        self.request_ids.clear();
        self.forwarding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(priority: u64, forwarded_host: Option<&str>) -> Arc<BatchEntry> {
        let (entry, _rx) = BatchEntry::with_channel(
            Bytes::from_static(b"payload"),
            priority,
            forwarded_host.map(str::to_string),
        );
        entry
    }

    #[test]
    fn ids_are_strictly_increasing_from_zero() {
        let mut builder = BatchBuilder::new(8);
        for _ in 0..3 {
            builder.push(entry(0, None));
        }
        let mut collected = Vec::new();
        let (direct, forwarded) = builder.build_with_limit(8, |id, _| collected.push(id));
        assert_eq!(collected, vec![0, 1, 2]);
        assert_eq!(direct.expect("direct").request_ids, vec![0, 1, 2]);
        assert!(forwarded.is_empty());

        builder.reset();
        builder.push(entry(0, None));
        let (direct, _) = builder.build_with_limit(8, |_, _| {});
        // The allocator keeps counting across rounds.
        assert_eq!(direct.expect("direct").request_ids, vec![3]);
    }

    #[test]
    fn limit_constrains_normal_tasks_only() {
        let mut builder = BatchBuilder::new(8);
        for _ in 0..4 {
            builder.push(entry(0, None));
        }
        builder.push(entry(HIGH_TASK_PRIORITY, None));
        builder.push(entry(HIGH_TASK_PRIORITY + 1, None));
        let (direct, _) = builder.build_with_limit(2, |_, _| {});
        // 2 normal entries consumed the limit; both high-priority entries
        // rode along anyway.
        assert_eq!(direct.expect("direct").len(), 4);
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn zero_limit_drains_high_priority_one_by_one() {
        let mut builder = BatchBuilder::new(8);
        builder.push(entry(0, None));
        builder.push(entry(HIGH_TASK_PRIORITY, None));
        let (direct, _) = builder.build_with_limit(0, |_, _| {});
        assert_eq!(direct.expect("direct").len(), 1);
        // The normal entry is still queued.
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn cancelled_entries_are_skipped_without_ids() {
        let mut builder = BatchBuilder::new(8);
        let cancelled = entry(0, None);
        cancelled.cancel();
        builder.push(cancelled);
        builder.push(entry(0, None));
        let mut collected = Vec::new();
        let (direct, _) = builder.build_with_limit(8, |id, _| collected.push(id));
        assert_eq!(collected, vec![0]);
        assert_eq!(direct.expect("direct").len(), 1);
    }

    #[test]
    fn forwarded_entries_split_per_target() {
        let mut builder = BatchBuilder::new(8);
        builder.push(entry(0, None));
        builder.push(entry(0, Some("peer-a")));
        builder.push(entry(0, Some("peer-b")));
        builder.push(entry(0, Some("peer-a")));
        let (direct, forwarded) = builder.build_with_limit(8, |_, _| {});
        assert_eq!(direct.expect("direct").len(), 1);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded["peer-a"].len(), 2);
        assert_eq!(forwarded["peer-b"].len(), 1);
    }

    #[test]
    fn reset_releases_payload_references() {
        let payload = Bytes::from(vec![0u8; 1024]);
        let (entry, _rx) = BatchEntry::with_channel(payload.clone(), 0, None);
        let mut builder = BatchBuilder::new(8);
        builder.push(entry);
        let (direct, _) = builder.build_with_limit(8, |_, _| {});
        drop(direct);
        builder.reset();
        // Ours is now the only handle left; the backing memory is free to go.
        assert!(payload.is_unique());
        assert_eq!(builder.len(), 0);
    }

    #[test]
    fn latest_req_start_tracks_maximum() {
        let mut builder = BatchBuilder::new(8);
        let first = entry(0, None);
        let second = entry(0, None);
        // `second` was created after `first`, so it defines the watermark.
        builder.push(Arc::clone(&second));
        builder.push(Arc::clone(&first));
        assert_eq!(builder.latest_req_start, Some(second.start));
    }

    #[test]
    fn cancel_terminates_all_queued() {
        let mut builder = BatchBuilder::new(8);
        let (entry1, rx1) = BatchEntry::with_channel(Bytes::new(), 0, None);
        let (entry2, rx2) = BatchEntry::with_channel(Bytes::new(), 0, None);
        builder.push(entry1);
        builder.push(entry2);
        builder.cancel(&Error::NoAvailableConnections);
        assert_eq!(builder.len(), 0);
        assert_eq!(
            rx1.blocking_recv().expect("terminal"),
            Err(Error::NoAvailableConnections)
        );
        assert_eq!(
            rx2.blocking_recv().expect("terminal"),
            Err(Error::NoAvailableConnections)
        );
    }
}
