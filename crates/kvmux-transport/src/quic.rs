// QUIC-backed implementation of the transport contract.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use kvmux_wire::{BatchRequest, BatchResponse, Frame, FrameHeader, StreamHello};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};

use crate::{BatchSink, BatchSource, ConnState, Transport, TransportConfig};

/// One lazily-dialed QUIC connection to a remote endpoint.
///
/// `connect` kicks off a background dial; the resulting connectivity is
/// published through a watch channel so `wait_for_state_change` can block on
/// it. When the connection dies the transport drops back to `Idle` and the
/// next `connect` re-dials.
pub struct QuicTransport {
    endpoint: Endpoint,
    addr: SocketAddr,
    server_name: String,
    config: TransportConfig,
    state: watch::Sender<ConnState>,
    conn: Arc<Mutex<Option<Connection>>>,
    dialing: Arc<AtomicBool>,
}

impl QuicTransport {
    /// Bind a client endpoint and prepare a transport for `addr`. No network
    /// traffic happens until `connect`.
    pub fn bind(
        bind_addr: SocketAddr,
        mut client_config: quinn::ClientConfig,
        addr: SocketAddr,
        server_name: &str,
        config: TransportConfig,
    ) -> Result<Self> {
        let mut quinn_transport = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(config.max_streams as u32);
        quinn_transport.max_concurrent_bidi_streams(streams);
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(bind_addr).context("bind QUIC client endpoint")?;
        endpoint.set_default_client_config(client_config);
        let (state, _) = watch::channel(ConnState::Idle);
        Ok(Self {
            endpoint,
            addr,
            server_name: server_name.to_string(),
            config,
            state,
            conn: Arc::new(Mutex::new(None)),
            dialing: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    fn connect(&self) {
        if *self.state.borrow() == ConnState::Ready {
            return;
        }
        // Single dialer at a time; concurrent callers piggyback on the watch.
        if self
            .dialing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let endpoint = self.endpoint.clone();
        let addr = self.addr;
        let server_name = self.server_name.clone();
        let state = self.state.clone();
        let conn_slot = Arc::clone(&self.conn);
        let dialing = Arc::clone(&self.dialing);
        tokio::spawn(async move {
            state.send_replace(ConnState::Connecting);
            let dialed = match endpoint.connect(addr, &server_name) {
                Ok(connecting) => connecting.await.map_err(anyhow::Error::from),
                Err(err) => Err(err.into()),
            };
            match dialed {
                Ok(connection) => {
                    *conn_slot.lock().await = Some(connection.clone());
                    state.send_replace(ConnState::Ready);
                    let monitor_state = state.clone();
                    let monitor_slot = Arc::clone(&conn_slot);
                    let id = connection.stable_id();
                    tokio::spawn(async move {
                        let reason = connection.closed().await;
                        tracing::info!(%reason, "quic connection closed");
                        let mut slot = monitor_slot.lock().await;
                        // A newer dial may already have replaced us.
                        if slot.as_ref().map(Connection::stable_id) == Some(id) {
                            *slot = None;
                            monitor_state.send_replace(ConnState::Idle);
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, %addr, "quic dial failed");
                    state.send_replace(ConnState::Failed);
                }
            }
            dialing.store(false, Ordering::SeqCst);
        });
    }

    async fn wait_for_state_change(&self, from: ConnState, deadline: tokio::time::Instant) -> bool {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() != from {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The sender half lives as long as the transport, so a closed
                // channel means the transport itself is gone.
                Ok(Err(_)) => return false,
                Err(_) => return false,
            }
        }
    }

    async fn open_stream(
        &self,
        forwarded_host: Option<&str>,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn BatchSource>)> {
        let connection = self
            .conn
            .lock()
            .await
            .clone()
            .context("transport not connected")?;
        let (mut send, recv) = connection.open_bi().await.context("open batch stream")?;
        let hello = StreamHello {
            forwarded_host: forwarded_host.map(str::to_string),
        };
        send.write_all(&hello.encode_frame())
            .await
            .context("write stream hello")?;
        Ok((
            Box::new(QuicBatchSink { send }),
            Box::new(QuicBatchSource {
                recv,
                max_frame_bytes: self.config.max_frame_bytes,
            }),
        ))
    }
}

struct QuicBatchSink {
    send: SendStream,
}

#[async_trait]
impl BatchSink for QuicBatchSink {
    async fn send(&mut self, batch: &BatchRequest) -> Result<()> {
        self.send
            .write_all(&batch.encode_frame())
            .await
            .context("write batch frame")
    }
}

struct QuicBatchSource {
    recv: RecvStream,
    max_frame_bytes: usize,
}

#[async_trait]
impl BatchSource for QuicBatchSource {
    async fn recv(&mut self) -> Result<BatchResponse> {
        let frame = read_frame(&mut self.recv, self.max_frame_bytes)
            .await?
            .context("batch stream closed")?;
        BatchResponse::decode(&frame).context("decode batch response")
    }
}

/// Write one already-framed message to a QUIC stream.
pub async fn write_frame(send: &mut SendStream, frame: &Bytes) -> Result<()> {
    send.write_all(frame).await.context("write frame")
}

/// Read one frame from a QUIC stream. `Ok(None)` means the peer finished the
/// stream cleanly between frames.
pub async fn read_frame(recv: &mut RecvStream, max_frame_bytes: usize) -> Result<Option<Frame>> {
    let mut header_buf = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_buf))
        .context("decode frame header")?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        anyhow::bail!("frame of {length} bytes exceeds limit {max_frame_bytes}");
    }
    let mut payload = vec![0u8; length];
    recv.read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

/// Read the stream-opening hello from a freshly accepted stream.
pub async fn read_hello(recv: &mut RecvStream, max_frame_bytes: usize) -> Result<StreamHello> {
    let frame = read_frame(recv, max_frame_bytes)
        .await?
        .context("stream closed before hello")?;
    StreamHello::decode(&frame).context("decode stream hello")
}
