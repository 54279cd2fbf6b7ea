// In-memory transport for deterministic core tests. Every stream the client
// opens surfaces as a `MockStreamHandle` the test can script: read the
// batches the client wrote, answer them, or break the stream.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use kvmux_transport::{BatchSink, BatchSource, ConnState, Transport};
use kvmux_wire::{BatchRequest, BatchResponse};

pub(crate) struct MockTransport {
    state: watch::Sender<ConnState>,
    streams_tx: mpsc::UnboundedSender<MockStreamHandle>,
    fail_opens: AtomicBool,
}

pub(crate) struct MockStreamHandle {
    pub(crate) forwarded_host: Option<String>,
    /// Batches the client wrote on this stream.
    pub(crate) requests: mpsc::UnboundedReceiver<BatchRequest>,
    /// Responses (or injected stream errors) the client will receive.
    pub(crate) responses: mpsc::UnboundedSender<std::result::Result<BatchResponse, String>>,
}

impl MockStreamHandle {
    pub(crate) fn echo(batch: &BatchRequest) -> BatchResponse {
        BatchResponse {
            request_ids: batch.request_ids.clone(),
            responses: batch.requests.clone(),
            transport_layer_load: 0,
            health_feedback: None,
        }
    }

    pub(crate) fn respond_echo(&self, batch: &BatchRequest) {
        let _ = self.responses.send(Ok(Self::echo(batch)));
    }

    pub(crate) fn fail_stream(&self, message: &str) {
        let _ = self.responses.send(Err(message.to_string()));
    }
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockStreamHandle>) {
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Idle);
        (
            Arc::new(Self {
                state,
                streams_tx,
                fail_opens: AtomicBool::new(false),
            }),
            streams_rx,
        )
    }

    pub(crate) fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    fn connect(&self) {
        self.state.send_replace(ConnState::Ready);
    }

    async fn wait_for_state_change(&self, from: ConnState, deadline: tokio::time::Instant) -> bool {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() != from {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return false,
                Err(_) => return false,
            }
        }
    }

    async fn open_stream(
        &self,
        forwarded_host: Option<&str>,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn BatchSource>)> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(anyhow!("injected stream open failure"));
        }
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let handle = MockStreamHandle {
            forwarded_host: forwarded_host.map(str::to_string),
            requests: request_rx,
            responses: response_tx,
        };
        self.streams_tx
            .send(handle)
            .map_err(|_| anyhow!("test dropped the stream registry"))?;
        Ok((
            Box::new(MockSink { tx: request_tx }),
            Box::new(MockSource { rx: response_rx }),
        ))
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<BatchRequest>,
}

#[async_trait]
impl BatchSink for MockSink {
    async fn send(&mut self, batch: &BatchRequest) -> Result<()> {
        self.tx
            .send(batch.clone())
            .map_err(|_| anyhow!("batch stream write side closed"))
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<std::result::Result<BatchResponse, String>>,
}

#[async_trait]
impl BatchSource for MockSource {
    async fn recv(&mut self) -> Result<BatchResponse> {
        match self.rx.recv().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("batch stream closed")),
        }
    }
}
