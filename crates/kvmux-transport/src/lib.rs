// Transport contract for the kvmux batching layer.
//
// The batching core never talks to the network directly; it drives one of
// these trait objects. One `Transport` is one logical connection to one
// remote endpoint, carrying any number of bidirectional batch streams.
use anyhow::Result;
use async_trait::async_trait;
use kvmux_wire::{BatchRequest, BatchResponse};

mod quic;

pub use quic::{QuicTransport, read_frame, read_hello, write_frame};

/// Transport-level configuration defaults.
///
/// ```
/// use kvmux_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub max_streams: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Keep defaults large enough for most dev/test workloads.
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_streams: 1024,
        }
    }
}

/// Connectivity of a transport, modelled after the usual dial lifecycle.
///
/// `Idle` means no connection attempt is in flight; `connect` moves the
/// transport towards `Ready`. A broken connection falls back to `Idle` (or
/// `Failed` when the dial itself errored) so callers can re-trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Ready,
    Failed,
}

/// One logical connection to a remote endpoint.
///
/// Implementations must be cheap to share behind an `Arc`; all methods take
/// `&self`. `open_stream` may only succeed while the state is `Ready`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current connectivity.
    fn state(&self) -> ConnState;

    /// Kick an idle or failed transport towards `Ready`. Non-blocking; the
    /// dial proceeds in the background and is observable via
    /// `wait_for_state_change`.
    fn connect(&self);

    /// Block until the state differs from `from` or the deadline passes.
    /// Returns false on deadline expiry.
    async fn wait_for_state_change(&self, from: ConnState, deadline: tokio::time::Instant) -> bool;

    /// Open a new bidirectional batch stream. A non-empty `forwarded_host`
    /// is attached to the stream so the peer relays traffic to that host.
    async fn open_stream(
        &self,
        forwarded_host: Option<&str>,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn BatchSource>)>;
}

/// Write half of a batch stream.
#[async_trait]
pub trait BatchSink: Send {
    async fn send(&mut self, batch: &BatchRequest) -> Result<()>;
}

/// Read half of a batch stream. `recv` resolves once per response frame and
/// errors when the stream breaks.
#[async_trait]
pub trait BatchSource: Send {
    async fn recv(&mut self) -> Result<BatchResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config() {
        // Basic sanity checks on defaults.
        let config = TransportConfig::default();
        assert!(config.max_frame_bytes > 0);
        assert!(config.max_streams > 0);
    }

    #[test]
    fn conn_state_is_comparable() {
        assert_ne!(ConnState::Idle, ConnState::Ready);
        assert_eq!(ConnState::Connecting, ConnState::Connecting);
    }
}
