// One outstanding submission and its completion surface.
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::config::HIGH_TASK_PRIORITY;
use crate::error::{Error, Result};

/// Callback invoked with the terminal outcome of an async submission.
pub type SubmitCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

enum Completion {
    Channel(oneshot::Sender<Result<Bytes>>),
    Callback(SubmitCallback),
}

/// One pending request, shared between the submitter, the fan-in queue, the
/// correlation table, and whichever loop terminates it.
///
/// Invariant: exactly one terminal event per entry. The completion slot is
/// taken at most once, so a racing late response and local timeout cannot
/// both deliver.
pub(crate) struct BatchEntry {
    pub(crate) payload: Bytes,
    pub(crate) priority: u64,
    /// Peer that should handle the request; `None` goes to the direct stream.
    pub(crate) forwarded_host: Option<String>,
    completion: Mutex<Option<Completion>>,
    is_async: bool,
    canceled: AtomicBool,
    /// When the entry was created and handed to the fan-in channel.
    pub(crate) start: Instant,
    send_lat_ns: AtomicI64,
    recv_lat_ns: AtomicI64,
}

impl BatchEntry {
    pub(crate) fn with_channel(
        payload: Bytes,
        priority: u64,
        forwarded_host: Option<String>,
    ) -> (std::sync::Arc<Self>, oneshot::Receiver<Result<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        let entry = Self::new(payload, priority, forwarded_host, Completion::Channel(tx), false);
        (std::sync::Arc::new(entry), rx)
    }

    pub(crate) fn with_callback(
        payload: Bytes,
        priority: u64,
        forwarded_host: Option<String>,
        callback: SubmitCallback,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(
            payload,
            priority,
            forwarded_host,
            Completion::Callback(callback),
            true,
        ))
    }

    fn new(
        payload: Bytes,
        priority: u64,
        forwarded_host: Option<String>,
        completion: Completion,
        is_async: bool,
    ) -> Self {
        Self {
            payload,
            priority,
            forwarded_host,
            completion: Mutex::new(Some(completion)),
            is_async,
            canceled: AtomicBool::new(false),
            start: Instant::now(),
            send_lat_ns: AtomicI64::new(0),
            recv_lat_ns: AtomicI64::new(0),
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_async(&self) -> bool {
        self.is_async
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_TASK_PRIORITY
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completion.lock().unwrap().is_none()
    }

    /// Stamp the latency from creation to the wire write.
    pub(crate) fn record_send_lat(&self, sent_at: Instant) {
        self.send_lat_ns.store(
            sent_at.duration_since(self.start).as_nanos() as i64,
            Ordering::Relaxed,
        );
    }

    /// Stamp the latency from creation to the response arriving.
    pub(crate) fn record_recv_lat(&self, received_at: Instant) {
        self.recv_lat_ns.store(
            received_at.duration_since(self.start).as_nanos() as i64,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn send_lat(&self) -> Option<Duration> {
        let nanos = self.send_lat_ns.load(Ordering::Relaxed);
        (nanos > 0).then(|| Duration::from_nanos(nanos as u64))
    }

    pub(crate) fn recv_lat(&self) -> Option<Duration> {
        let nanos = self.recv_lat_ns.load(Ordering::Relaxed);
        (nanos > 0).then(|| Duration::from_nanos(nanos as u64))
    }

    pub(crate) fn respond(&self, payload: Bytes) {
        self.complete(Ok(payload));
    }

    pub(crate) fn fail(&self, err: Error) {
        self.complete(Err(err));
    }

    fn complete(&self, result: Result<Bytes>) {
        let completion = self.completion.lock().unwrap().take();
        match completion {
            Some(Completion::Channel(tx)) => {
                // The submitter may have given up already; that's fine.
                let _ = tx.send(result);
            }
            Some(Completion::Callback(callback)) => callback(result),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn channel_entry_delivers_once() {
        let (entry, rx) = BatchEntry::with_channel(Bytes::from_static(b"req"), 0, None);
        entry.respond(Bytes::from_static(b"resp"));
        // The second terminal event is swallowed.
        entry.fail(Error::ConnectionClosed);
        let got = rx.await.expect("delivered").expect("ok");
        assert_eq!(got, Bytes::from_static(b"resp"));
        assert!(entry.is_completed());
    }

    #[test]
    fn callback_entry_invoked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        let entry = BatchEntry::with_callback(
            Bytes::from_static(b"req"),
            0,
            Some("peer".to_string()),
            Box::new(move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(entry.is_async());
        entry.fail(Error::ClientClosed);
        entry.respond(Bytes::from_static(b"late"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn latency_accumulators_report_after_stamping() {
        let (entry, _rx) = BatchEntry::with_channel(Bytes::new(), 0, None);
        assert_eq!(entry.send_lat(), None);
        assert_eq!(entry.recv_lat(), None);
        let later = entry.start + Duration::from_millis(5);
        entry.record_send_lat(later);
        entry.record_recv_lat(later + Duration::from_millis(2));
        assert_eq!(entry.send_lat(), Some(Duration::from_millis(5)));
        assert_eq!(entry.recv_lat(), Some(Duration::from_millis(7)));
    }

    #[test]
    fn cancel_flag_and_priority() {
        let (entry, _rx) = BatchEntry::with_channel(Bytes::new(), HIGH_TASK_PRIORITY, None);
        assert!(entry.is_high_priority());
        assert!(!entry.is_canceled());
        entry.cancel();
        assert!(entry.is_canceled());
    }
}
