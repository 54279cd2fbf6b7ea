// One transport connection multiplexing batch streams to a single endpoint.
//
// The client owns the write halves of its streams (one direct, one per
// forwarded host) plus the correlation table matching request ids back to
// pending entries. Each stream's read half is driven by its own receive
// loop task, which also performs stream recovery when a receive fails.
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, Notify};

use kvmux_transport::{BatchSink, BatchSource, ConnState, Transport};
use kvmux_wire::{BatchRequest, BatchResponse};

use crate::config::{BATCH_RECV_TAIL_LAT_THRESHOLD, BatchConfig};
use crate::entry::BatchEntry;
use crate::error::Error;

/// Observer for health feedback piggybacked on batch responses.
pub trait HealthListener: Send + Sync {
    fn on_health_feedback(&self, feedback: &Bytes);
}

/// Write halves of the client's streams, guarded by the send mutex.
///
/// `recreating` implements the try-lock-for-send / exclusive-lock-for-
/// recreate discipline: senders acquire the mutex and back off if the flag
/// is set; recovery sets the flag (excluding senders) without holding the
/// mutex across its reconnect waits.
pub(crate) struct StreamSet {
    recreating: bool,
    direct: Option<Box<dyn BatchSink>>,
    forwarded: HashMap<String, Box<dyn BatchSink>>,
}

enum RecreateOutcome {
    /// The client was closed while recovering.
    Stopped,
    /// A fresh stream was installed; the receive loop adopts this source.
    Replaced(Box<dyn BatchSource>),
    /// Recreation failed; keep receiving from the broken source (the next
    /// error retries).
    Unchanged,
}

pub(crate) struct StreamClient {
    pub(crate) target: String,
    transport: Arc<dyn Transport>,
    streams: Mutex<StreamSet>,
    recreate_notify: Notify,
    /// Correlation table: request id -> pending entry. The single source of
    /// truth for which entries this client still owes a terminal event.
    pending: DashMap<u64, Arc<BatchEntry>>,
    /// In-flight count. May go negative transiently during recovery races;
    /// `available` is defined to tolerate that instead of locking.
    sent: AtomicI64,
    limit: AtomicI64,
    /// Bumped once per recovery; elects a single recoverer per failure even
    /// when several receive loops observe it.
    epoch: AtomicU64,
    closed: AtomicBool,
    shared_load: Arc<AtomicU64>,
    listener: std::sync::RwLock<Option<Arc<dyn HealthListener>>>,
    config: Arc<BatchConfig>,
}

impl StreamClient {
    pub(crate) fn new(
        target: String,
        transport: Arc<dyn Transport>,
        shared_load: Arc<AtomicU64>,
        config: Arc<BatchConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            transport,
            streams: Mutex::new(StreamSet {
                recreating: false,
                direct: None,
                forwarded: HashMap::new(),
            }),
            recreate_notify: Notify::new(),
            pending: DashMap::new(),
            sent: AtomicI64::new(0),
            limit: AtomicI64::new(config.max_concurrency_request_limit),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shared_load,
            listener: std::sync::RwLock::new(None),
            config,
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_health_listener(&self, listener: Option<Arc<dyn HealthListener>>) {
        *self.listener.write().unwrap() = listener;
    }

    /// Remaining request budget. `sent` can be negative after recovery
    /// decremented entries that were never counted; treat that as a free
    /// client rather than blocking new sends on a lock.
    pub(crate) fn available(&self) -> i64 {
        let limit = self.limit.load(Ordering::Relaxed);
        let sent = self.sent.load(Ordering::Relaxed);
        if sent > 0 {
            if limit > sent {
                return limit - sent;
            }
            return 0;
        }
        limit
    }

    /// Acquire the send lock unless recovery is in progress.
    pub(crate) async fn try_lock_for_send(&self) -> Option<MutexGuard<'_, StreamSet>> {
        let guard = self.streams.lock().await;
        if guard.recreating {
            return None;
        }
        Some(guard)
    }

    async fn lock_for_recreate(&self) {
        loop {
            let notified = self.recreate_notify.notified();
            {
                let mut set = self.streams.lock().await;
                if !set.recreating {
                    set.recreating = true;
                    return;
                }
            }
            notified.await;
        }
    }

    async fn unlock_for_recreate(&self) {
        {
            let mut set = self.streams.lock().await;
            set.recreating = false;
        }
        self.recreate_notify.notify_waiters();
    }

    /// Store an entry in the correlation table. Must happen before the wire
    /// write so a fast response always finds its entry.
    pub(crate) fn insert_pending(&self, id: u64, entry: Arc<BatchEntry>) {
        self.pending.insert(id, entry);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Write one batch on the stream for `forwarded_host`, creating the
    /// stream first if needed. Write errors fast-fail exactly the ids in
    /// this batch; stream recovery is the receive loop's job.
    pub(crate) async fn send(
        client: &Arc<Self>,
        set: &mut StreamSet,
        forwarded_host: Option<&str>,
        batch: BatchRequest,
    ) {
        if let Err(err) = Self::init_stream(client, set, forwarded_host).await {
            tracing::warn!(
                peer = %client.target,
                forwarded = forwarded_host.unwrap_or(""),
                error = %err,
                "creating batch stream failed",
            );
            client.fail_requests_by_ids(&Error::transport(&err), &batch.request_ids);
            return;
        }
        let sink = match forwarded_host {
            None => set.direct.as_mut(),
            Some(host) => set.forwarded.get_mut(host),
        };
        let Some(sink) = sink else {
            client.fail_requests_by_ids(
                &Error::Transport("batch stream missing after init".to_string()),
                &batch.request_ids,
            );
            return;
        };
        if let Err(err) = sink.send(&batch).await {
            tracing::info!(
                peer = %client.target,
                forwarded = forwarded_host.unwrap_or(""),
                requests = batch.len(),
                error = %err,
                "sending batch met an error",
            );
            client.fail_requests_by_ids(&Error::transport(&err), &batch.request_ids);
        }
    }

    /// Idempotent: returns immediately when the stream for `forwarded_host`
    /// already exists. Otherwise waits for connection readiness, opens the
    /// stream, and spawns its receive loop.
    async fn init_stream(
        client: &Arc<Self>,
        set: &mut StreamSet,
        forwarded_host: Option<&str>,
    ) -> anyhow::Result<()> {
        match forwarded_host {
            None if set.direct.is_some() => return Ok(()),
            Some(host) if set.forwarded.contains_key(host) => return Ok(()),
            _ => {}
        }
        client.wait_conn_ready().await?;
        let (sink, source) = client.transport.open_stream(forwarded_host).await?;
        match forwarded_host {
            None => set.direct = Some(sink),
            Some(host) => {
                set.forwarded.insert(host.to_string(), sink);
            }
        }
        Self::spawn_recv_loop(client, source, forwarded_host.map(str::to_string));
        Ok(())
    }

    /// Drive the transport from Idle towards Ready, bounded by the dial
    /// timeout.
    async fn wait_conn_ready(&self) -> anyhow::Result<()> {
        if self.transport.state() == ConnState::Ready {
            return Ok(());
        }
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.dial_timeout;
        loop {
            let state = self.transport.state();
            if state == ConnState::Ready {
                break;
            }
            if matches!(state, ConnState::Idle | ConnState::Failed) {
                self.transport.connect();
            }
            if !self.transport.wait_for_state_change(state, deadline).await {
                t_duration!("kvmux_batch_client_wait_establish_seconds", start.elapsed());
                anyhow::bail!(
                    "connection to {} not ready within {:?}",
                    self.target,
                    self.config.dial_timeout
                );
            }
        }
        t_duration!("kvmux_batch_client_wait_establish_seconds", start.elapsed());
        Ok(())
    }

    fn finish_failed(&self, entry: Arc<BatchEntry>, err: Error) {
        self.sent.fetch_sub(1, Ordering::Relaxed);
        entry.fail(err);
    }

    /// Fail exactly the given ids (skipping ones already resolved).
    pub(crate) fn fail_requests_by_ids(&self, err: &Error, request_ids: &[u64]) {
        for id in request_ids {
            if let Some((_, entry)) = self.pending.remove(id) {
                self.finish_failed(entry, err.clone());
            }
        }
    }

    /// Fail every pending entry routed to `forwarded_host` — and only those.
    /// Entries riding healthy streams to other hosts keep their delivery
    /// surface; failing them here would race the receive loop that is about
    /// to deliver their responses.
    pub(crate) fn fail_pending_requests(&self, err: &Error, forwarded_host: Option<&str>) {
        let matching: Vec<u64> = self
            .pending
            .iter()
            .filter(|kv| kv.value().forwarded_host.as_deref() == forwarded_host)
            .map(|kv| *kv.key())
            .collect();
        for id in matching {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.finish_failed(entry, err.clone());
            }
        }
    }

    /// On shutdown, synchronous submitters learn about closure from their
    /// own select loops; only async entries still need a terminal event.
    fn fail_async_requests_on_close(&self) {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|kv| kv.value().is_async())
            .map(|kv| *kv.key())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.finish_failed(entry, Error::ClientClosed);
            }
        }
    }

    fn spawn_recv_loop(client: &Arc<Self>, source: Box<dyn BatchSource>, forwarded_host: Option<String>) {
        let client = Arc::clone(client);
        tokio::spawn(async move {
            let mut source = source;
            loop {
                let run = AssertUnwindSafe(
                    client.recv_loop(&mut source, forwarded_host.as_deref()),
                )
                .catch_unwind()
                .await;
                match run {
                    Ok(()) => {
                        client.fail_async_requests_on_close();
                        return;
                    }
                    Err(_) => {
                        t_counter!("kvmux_loop_panics_total", "loop" => "recv").increment(1);
                        tracing::error!(
                            peer = %client.target,
                            "batch recv loop panicked, restarting",
                        );
                    }
                }
            }
        });
    }

    async fn recv_loop(&self, source: &mut Box<dyn BatchSource>, forwarded_host: Option<&str>) {
        let mut epoch = self.epoch.load(Ordering::SeqCst);
        loop {
            let recv_start = Instant::now();
            let result = source.recv().await;
            let recv_dur = recv_start.elapsed();
            t_duration!("kvmux_batch_recv_loop_seconds", "stage" => "recv"; recv_dur);
            if recv_dur > BATCH_RECV_TAIL_LAT_THRESHOLD {
                t_duration!("kvmux_batch_recv_tail_seconds", recv_dur);
            }
            match result {
                Ok(response) => {
                    self.process_response(response, forwarded_host);
                    t_duration!(
                        "kvmux_batch_recv_loop_seconds", "stage" => "process";
                        recv_start.elapsed()
                    );
                }
                Err(err) => {
                    if self.is_stopped() {
                        return;
                    }
                    tracing::debug!(
                        peer = %self.target,
                        forwarded = forwarded_host.unwrap_or(""),
                        error = %err,
                        "batch stream receive failed, reconnecting",
                    );
                    let down_start = Instant::now();
                    match self.recreate_stream(&err, forwarded_host, &mut epoch).await {
                        RecreateOutcome::Stopped => return,
                        RecreateOutcome::Replaced(new_source) => {
                            *source = new_source;
                            t_duration!(
                                "kvmux_batch_client_unavailable_seconds",
                                down_start.elapsed()
                            );
                        }
                        RecreateOutcome::Unchanged => {}
                    }
                }
            }
        }
    }

    fn process_response(&self, response: BatchResponse, forwarded_host: Option<&str>) {
        if let Some(feedback) = &response.health_feedback {
            let listener = self.listener.read().unwrap().clone();
            if let Some(listener) = listener {
                listener.on_health_feedback(feedback);
            }
        }
        let received = Instant::now();
        for (index, &id) in response.request_ids.iter().enumerate() {
            let Some((_, entry)) = self.pending.remove(&id) else {
                // The send path may have fast-failed this id while the server
                // still processed it; the late answer is dropped.
                tracing::warn!(
                    peer = %self.target,
                    request_id = id,
                    forwarded = forwarded_host.unwrap_or(""),
                    "received response for an unknown request id",
                );
                continue;
            };
            entry.record_recv_lat(received);
            if !entry.is_canceled() {
                match response.responses.get(index) {
                    Some(payload) => entry.respond(payload.clone()),
                    None => entry.fail(Error::Transport(
                        "batch response missing payload".to_string(),
                    )),
                }
            }
            self.sent.fetch_sub(1, Ordering::Relaxed);
        }
        if response.transport_layer_load > 0 && self.config.max_batch_wait_time > Duration::ZERO {
            // The remote's load only matters while the overload wait is on.
            self.shared_load
                .store(response.transport_layer_load, Ordering::Relaxed);
        }
    }

    async fn recreate_stream(
        &self,
        err: &anyhow::Error,
        forwarded_host: Option<&str>,
        epoch: &mut u64,
    ) -> RecreateOutcome {
        self.lock_for_recreate().await;
        let outcome = self.recreate_stream_locked(err, forwarded_host, epoch).await;
        self.unlock_for_recreate().await;
        outcome
    }

    async fn recreate_stream_locked(
        &self,
        err: &anyhow::Error,
        forwarded_host: Option<&str>,
        epoch: &mut u64,
    ) -> RecreateOutcome {
        // One receive loop per epoch wins the CAS and performs the full
        // recovery (fail this stream's pending entries, then reconnect with
        // retries). Losers observed the same connection failure through their
        // own streams; the winner already paid for readiness, so they attempt
        // a single stream recreation and otherwise keep their broken source.
        let won = self
            .epoch
            .compare_exchange(*epoch, *epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !won {
            *epoch = self.epoch.load(Ordering::SeqCst);
            let outcome = match self.open_and_install(forwarded_host).await {
                Ok(source) => RecreateOutcome::Replaced(source),
                Err(recreate_err) => {
                    tracing::info!(
                        peer = %self.target,
                        forwarded = forwarded_host.unwrap_or(""),
                        error = %recreate_err,
                        "batch stream re-create failed",
                    );
                    RecreateOutcome::Unchanged
                }
            };
            if self.is_stopped() {
                return RecreateOutcome::Stopped;
            }
            return outcome;
        }
        *epoch += 1;

        self.fail_pending_requests(&Error::transport(err), forwarded_host);

        let mut backoff = Duration::from_millis(10);
        loop {
            if self.is_stopped() {
                return RecreateOutcome::Stopped;
            }
            match self.recreate_once(forwarded_host).await {
                Ok(source) => {
                    tracing::info!(
                        peer = %self.target,
                        forwarded = forwarded_host.unwrap_or(""),
                        "batch stream re-created",
                    );
                    return RecreateOutcome::Replaced(source);
                }
                Err(recreate_err) => {
                    tracing::info!(
                        peer = %self.target,
                        forwarded = forwarded_host.unwrap_or(""),
                        error = %recreate_err,
                        "batch stream re-create failed, backing off",
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }

    async fn recreate_once(&self, forwarded_host: Option<&str>) -> anyhow::Result<Box<dyn BatchSource>> {
        self.wait_conn_ready().await?;
        self.open_and_install(forwarded_host).await
    }

    /// Open a replacement stream and swap its write half into the set. The
    /// read half goes back to the calling receive loop; no new loop spawns.
    async fn open_and_install(
        &self,
        forwarded_host: Option<&str>,
    ) -> anyhow::Result<Box<dyn BatchSource>> {
        let (sink, source) = self.transport.open_stream(forwarded_host).await?;
        let mut set = self.streams.lock().await;
        match forwarded_host {
            None => set.direct = Some(sink),
            Some(host) => {
                set.forwarded.insert(host.to_string(), sink);
            }
        }
        Ok(source)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn sent_count(&self) -> i64 {
        self.sent.load(Ordering::Relaxed)
    }
}
