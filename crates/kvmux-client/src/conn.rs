// Batch connection: the fan-in channel, the send loop that drains it into
// wire batches, and the submit API callers use.
use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use kvmux_transport::Transport;

use crate::builder::BatchBuilder;
use crate::config::{BATCH_SEND_TAIL_LAT_THRESHOLD, BatchConfig};
use crate::entry::{BatchEntry, SubmitCallback};
use crate::error::{Error, Result};
use crate::stream::{HealthListener, StreamClient};
use crate::trigger::AdaptiveTrigger;

pub(crate) const SEND_FAILED_NO_AVAILABLE_LIMIT: &str = "concurrency limit exceeded";
pub(crate) const SEND_FAILED_TRY_LOCK: &str = "try-lock for send failed";

static INVALID_BATCH_POLICY_WARN: Once = Once::new();

/// One submission handed to [`BatchConn::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub payload: Bytes,
    /// Peer that should ultimately handle the request; `None` goes straight
    /// to the endpoint this connection dials.
    pub forwarded_host: Option<String>,
    pub priority: u64,
    pub timeout: Duration,
}

impl SubmitRequest {
    pub fn new(payload: Bytes, timeout: Duration) -> Self {
        Self {
            payload,
            forwarded_host: None,
            priority: 0,
            timeout,
        }
    }
}

/// Coalesces concurrent submissions to one endpoint into batches carried by
/// a pool of stream clients.
///
/// Construct with [`BatchConn::new`], then start draining with
/// [`BatchConn::spawn_send_loop`]. After `idle_timeout` without traffic the
/// connection flags itself idle and notifies the owner (CAS 0 -> 1 on the
/// shared slot) so it can be torn down and rebuilt.
pub struct BatchConn {
    tx: mpsc::Sender<Arc<BatchEntry>>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<Arc<BatchEntry>>>>,
    clients: Vec<Arc<StreamClient>>,
    closed: watch::Sender<bool>,
    idle: AtomicU32,
    idle_notify: Arc<AtomicU32>,
    shared_load: Arc<AtomicU64>,
    config: Arc<BatchConfig>,
    target: String,
    send_loop_panics: AtomicU64,
}

impl BatchConn {
    /// One stream client is created per transport; round-robin dispatch
    /// spreads batches across them.
    pub fn new(
        target: impl Into<String>,
        transports: Vec<Arc<dyn Transport>>,
        config: BatchConfig,
        idle_notify: Arc<AtomicU32>,
    ) -> Arc<Self> {
        let target = target.into();
        let config = Arc::new(config);
        let shared_load = Arc::new(AtomicU64::new(0));
        let clients = transports
            .into_iter()
            .map(|transport| {
                StreamClient::new(
                    target.clone(),
                    transport,
                    Arc::clone(&shared_load),
                    Arc::clone(&config),
                )
            })
            .collect();
        let (tx, rx) = mpsc::channel(config.max_batch_size.max(1));
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            clients,
            closed,
            idle: AtomicU32::new(0),
            idle_notify,
            shared_load,
            config,
            target,
            send_loop_panics: AtomicU64::new(0),
        })
    }

    /// Start the send loop. Subsequent calls are no-ops.
    pub fn spawn_send_loop(conn: &Arc<Self>) {
        let Some(mut rx) = conn.rx.lock().unwrap().take() else {
            return;
        };
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let mut builder = BatchBuilder::new(conn.config.max_batch_size);
            let mut index = 0usize;
            loop {
                let (mut trigger, policy_ok) = AdaptiveTrigger::from_policy(&conn.config.batch_policy);
                if !policy_ok {
                    let policy = conn.config.batch_policy.clone();
                    INVALID_BATCH_POLICY_WARN.call_once(|| {
                        tracing::warn!(
                            value = %policy,
                            "falling back to the default batch policy due to an invalid value",
                        );
                    });
                }
                let mut avg_batch_wait_size = conn.config.batch_wait_size as f64;
                let run = AssertUnwindSafe(conn.send_loop(
                    &mut rx,
                    &mut builder,
                    &mut trigger,
                    &mut avg_batch_wait_size,
                    &mut index,
                ))
                .catch_unwind()
                .await;
                match run {
                    Ok(()) => return,
                    Err(_) => {
                        conn.send_loop_panics.fetch_add(1, Ordering::Relaxed);
                        t_counter!("kvmux_loop_panics_total", "loop" => "send").increment(1);
                        tracing::error!(
                            peer = %conn.target,
                            "batch send loop panicked, restarting",
                        );
                    }
                }
            }
        });
    }

    /// Submit one request and wait for its response. The timeout covers both
    /// enqueueing and the wait for the response; dropping the returned
    /// future cancels the entry so a late response is discarded.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Bytes> {
        let SubmitRequest {
            payload,
            forwarded_host,
            priority,
            timeout,
        } = request;
        let (entry, response_rx) = BatchEntry::with_channel(payload, priority, forwarded_host);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut closed = self.closed.subscribe();

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => return Err(Error::ConnectionClosed),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::DeadlineExceeded { reason: "wait sendLoop".to_string() });
            }
            enqueued = self.tx.send(Arc::clone(&entry)) => {
                if enqueued.is_err() {
                    return Err(Error::ConnectionClosed);
                }
            }
        }

        let guard = CancelOnDrop::new(Arc::clone(&entry));
        let result = tokio::select! {
            biased;
            response = response_rx => match response {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionClosed),
            },
            _ = closed.wait_for(|closed| *closed) => {
                entry.cancel();
                Err(Error::ConnectionClosed)
            }
            _ = tokio::time::sleep_until(deadline) => {
                entry.cancel();
                Err(Error::DeadlineExceeded {
                    reason: recv_timeout_reason(&entry, timeout),
                })
            }
        };
        guard.disarm();

        if let Some(send_lat) = entry.send_lat() {
            t_duration!("kvmux_request_send_seconds", send_lat);
        }
        if let Some(recv_lat) = entry.recv_lat() {
            t_duration!("kvmux_request_recv_seconds", recv_lat);
        }
        t_duration!("kvmux_request_done_seconds", entry.start.elapsed());
        result
    }

    /// Fire-and-account form: the callback receives the terminal outcome
    /// (response, error, or deadline) exactly once.
    pub fn submit_with_callback(&self, request: SubmitRequest, callback: SubmitCallback) {
        let SubmitRequest {
            payload,
            forwarded_host,
            priority,
            timeout,
        } = request;
        let entry = BatchEntry::with_callback(payload, priority, forwarded_host, callback);
        let deadline = tokio::time::Instant::now() + timeout;
        let tx = self.tx.clone();
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => {
                    entry.fail(Error::ConnectionClosed);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    entry.fail(Error::DeadlineExceeded { reason: "wait sendLoop".to_string() });
                    return;
                }
                enqueued = tx.send(Arc::clone(&entry)) => {
                    if enqueued.is_err() {
                        entry.fail(Error::ConnectionClosed);
                        return;
                    }
                }
            }
            // The response path invokes the callback directly; this watcher
            // only has to turn the deadline into a terminal event.
            tokio::time::sleep_until(deadline).await;
            if !entry.is_completed() {
                entry.cancel();
                entry.fail(Error::DeadlineExceeded {
                    reason: recv_timeout_reason(&entry, timeout),
                });
            }
        });
    }

    /// Marks every stream client closed and wakes all waiters. The fan-in
    /// channel is left open: submitters still holding a sender must not
    /// observe a closed-channel panic path, they get `ConnectionClosed`
    /// through the watch instead.
    pub fn close(&self) {
        for client in &self.clients {
            client.mark_closed();
        }
        let _ = self.closed.send(true);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed) != 0
    }

    pub fn set_health_listener(&self, listener: Option<Arc<dyn HealthListener>>) {
        for client in &self.clients {
            client.set_health_listener(listener.clone());
        }
    }

    /// Number of send-loop restarts caused by panics.
    pub fn send_loop_panics(&self) -> u64 {
        self.send_loop_panics.load(Ordering::Relaxed)
    }

    async fn send_loop(
        &self,
        rx: &mut mpsc::Receiver<Arc<BatchEntry>>,
        builder: &mut BatchBuilder,
        trigger: &mut AdaptiveTrigger,
        avg_batch_wait_size: &mut f64,
        index: &mut usize,
    ) {
        let turbo_wait = trigger.turbo_wait_time();
        loop {
            let loop_start = Instant::now();
            builder.reset();

            let (head_recv_time, head_arrival_interval) =
                self.fetch_all_pending_requests(rx, builder).await;
            if builder.len() == 0 {
                // Closed, or flagged idle for recycling.
                return;
            }

            let batch_size = builder.len();
            if batch_size < self.config.max_batch_size {
                if self.config.max_batch_wait_time > Duration::ZERO
                    && self.shared_load.load(Ordering::Relaxed) > self.config.overload_threshold
                {
                    // The remote is overloaded; larger batches cost it less.
                    t_counter!("kvmux_batch_wait_overload_total").increment(1);
                    self.fetch_more_pending_requests(
                        rx,
                        builder,
                        self.config.max_batch_size,
                        self.config.batch_wait_size,
                        self.config.max_batch_wait_time,
                    )
                    .await;
                } else if turbo_wait > Duration::ZERO
                    && head_arrival_interval > Duration::ZERO
                    && trigger.need_fetch_more(head_arrival_interval)
                {
                    let wait_size = trigger
                        .preferred_batch_wait_size(*avg_batch_wait_size, self.config.batch_wait_size);
                    self.fetch_more_pending_requests(
                        rx,
                        builder,
                        self.config.max_batch_size,
                        wait_size,
                        turbo_wait,
                    )
                    .await;
                    t_histogram!("kvmux_batch_more_requests")
                        .record((builder.len() - batch_size) as f64);
                }
            }

            let length = builder.len();
            *avg_batch_wait_size = 0.2 * length as f64 + 0.8 * *avg_batch_wait_size;
            t_histogram!("kvmux_batch_pending_requests").record((rx.len() + length) as f64);
            t_histogram!("kvmux_batch_best_size").record(*avg_batch_wait_size);
            t_duration!("kvmux_batch_head_arrival_interval_seconds", head_arrival_interval);
            t_duration!(
                "kvmux_batch_send_loop_seconds", "stage" => "wait-head";
                head_recv_time.duration_since(loop_start)
            );
            t_duration!(
                "kvmux_batch_send_loop_seconds", "stage" => "wait-more";
                loop_start.elapsed()
            );

            self.dispatch(builder, index).await;

            let loop_end = Instant::now();
            t_duration!(
                "kvmux_batch_send_loop_seconds", "stage" => "send";
                loop_end.duration_since(loop_start)
            );
            let since_head = loop_end.duration_since(head_recv_time);
            if since_head > BATCH_SEND_TAIL_LAT_THRESHOLD {
                t_duration!("kvmux_batch_send_tail_seconds", since_head);
            }
        }
    }

    /// Block for the round's head entry (or idle/closed), then sweep
    /// whatever else is immediately available up to the batch cap.
    async fn fetch_all_pending_requests(
        &self,
        rx: &mut mpsc::Receiver<Arc<BatchEntry>>,
        builder: &mut BatchBuilder,
    ) -> (Instant, Duration) {
        let latest_req_start = builder.latest_req_start;
        let mut closed = self.closed.subscribe();
        let head = tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => return (Instant::now(), Duration::ZERO),
            },
            _ = tokio::time::sleep(self.config.idle_timeout) => {
                self.idle.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .idle_notify
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
                // The owner recycles this connection once notified.
                return (Instant::now(), Duration::ZERO);
            }
            _ = closed.wait_for(|closed| *closed) => {
                return (Instant::now(), Duration::ZERO);
            }
        };
        let head_recv_time = Instant::now();
        let head_arrival_interval = match latest_req_start {
            Some(latest) if head.start > latest => head.start.duration_since(latest),
            _ => Duration::ZERO,
        };
        builder.push(head);
        while builder.len() < self.config.max_batch_size {
            match rx.try_recv() {
                Ok(entry) => builder.push(entry),
                Err(_) => break,
            }
        }
        (head_recv_time, head_arrival_interval)
    }

    /// Wait up to `max_wait_time` to reach `batch_wait_size` entries, then
    /// sweep non-blocking up to `max_batch_size`, yielding exactly once so
    /// entries submitted a moment ago can land in the channel.
    async fn fetch_more_pending_requests(
        &self,
        rx: &mut mpsc::Receiver<Arc<BatchEntry>>,
        builder: &mut BatchBuilder,
        max_batch_size: usize,
        batch_wait_size: usize,
        max_wait_time: Duration,
    ) {
        let timer = tokio::time::sleep(max_wait_time);
        tokio::pin!(timer);
        while builder.len() < batch_wait_size {
            tokio::select! {
                entry = rx.recv() => match entry {
                    Some(entry) => builder.push(entry),
                    None => return,
                },
                _ = &mut timer => break,
            }
        }
        let mut yielded = false;
        while builder.len() < max_batch_size {
            match rx.try_recv() {
                Ok(entry) => builder.push(entry),
                Err(_) => {
                    if yielded {
                        break;
                    }
                    tokio::task::yield_now().await;
                    yielded = true;
                }
            }
        }
    }

    /// Round-robin over the stream clients, skipping ones without capacity
    /// (unless a high-priority task bypasses the limit) and ones locked for
    /// recovery; build and write this round's batches on the first match.
    async fn dispatch(&self, builder: &mut BatchBuilder, index: &mut usize) {
        let has_high_priority = builder.has_high_priority_task();
        let mut reasons: Vec<&'static str> = Vec::new();
        let mut chosen = None;
        for _ in 0..self.clients.len() {
            *index = (*index + 1) % self.clients.len();
            let client = &self.clients[*index];
            if has_high_priority || client.available() > 0 {
                match client.try_lock_for_send().await {
                    Some(set) => {
                        chosen = Some((client, set));
                        break;
                    }
                    None => reasons.push(SEND_FAILED_TRY_LOCK),
                }
            } else {
                reasons.push(SEND_FAILED_NO_AVAILABLE_LIMIT);
            }
        }
        let Some((client, mut set)) = chosen else {
            tracing::info!(peer = %self.target, ?reasons, "no available connections");
            t_counter!("kvmux_no_available_connections_total").increment(1);
            if !self.config.concurrency_limit_enabled() {
                // Compatibility with the pre-limit behavior: cancel instead
                // of letting entries wait out their full timeout.
                builder.cancel(&Error::NoAvailableConnections);
            }
            return;
        };

        let available = client.available();
        let send_time = Instant::now();
        let (direct, forwarding) = builder.build_with_limit(available, |id, entry| {
            client.insert_pending(id, Arc::clone(entry));
            entry.record_send_lat(send_time);
        });
        let mut batch = 0usize;
        if let Some(request) = direct {
            batch += request.len();
            StreamClient::send(client, &mut set, None, request).await;
        }
        for (host, request) in forwarding {
            batch += request.len();
            StreamClient::send(client, &mut set, Some(&host), request).await;
        }
        if batch > 0 {
            t_histogram!("kvmux_batch_size").record(batch as f64);
        }
    }

    #[cfg(test)]
    pub(crate) fn clients(&self) -> &[Arc<StreamClient>] {
        &self.clients
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.config.max_batch_size.max(1) - self.tx.capacity()
    }
}

fn recv_timeout_reason(entry: &BatchEntry, timeout: Duration) -> String {
    let mut reason = format!("wait recvLoop timeout, timeout={timeout:?}");
    if let Some(send_lat) = entry.send_lat() {
        reason.push_str(&format!(", send={send_lat:?}"));
        if let Some(recv_lat) = entry.recv_lat() {
            reason.push_str(&format!(", recv={:?}", recv_lat.saturating_sub(send_lat)));
        }
    }
    reason
}

/// Sets the entry's cancel flag if the submitter's future is dropped before
/// a terminal event, so a late response is discarded instead of delivered to
/// nobody.
struct CancelOnDrop {
    entry: Arc<BatchEntry>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(entry: Arc<BatchEntry>) -> Self {
        Self { entry, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.entry.cancel();
        }
    }
}
