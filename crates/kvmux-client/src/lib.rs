//! Client-side request batching and multiplexing for a remote key-value node.
//!
//! Many small, concurrent, logically independent requests to the same
//! endpoint are coalesced into larger wire batches multiplexed over a small
//! pool of long-lived bidirectional streams. Per-request completion
//! semantics are preserved (response delivery, cancellation, timeout,
//! errors, priority), streams recover automatically on transport failure,
//! and requests can be forwarded through an intermediate peer, each peer
//! getting its own stream.
//!
//! The pipeline per endpoint: callers hand entries to [`BatchConn::submit`],
//! a send loop drains the fan-in channel, an adaptive trigger decides
//! whether to wait for more entries, the builder assigns request ids and
//! forms batches, and a round-robin dispatcher writes them on a stream
//! client with capacity. Responses come back asynchronously on each stream
//! and are matched to waiting callers through a correlation table.
#[macro_use]
mod macros;

mod builder;
mod config;
mod conn;
mod entry;
mod error;
mod queue;
mod stream;
mod trigger;

#[cfg(test)]
mod testing;

pub use config::{
    BATCH_POLICY_BASIC, BATCH_POLICY_POSITIVE, BATCH_POLICY_STANDARD, BatchConfig,
    DEF_BATCH_POLICY, HIGH_TASK_PRIORITY,
};
pub use conn::{BatchConn, SubmitRequest};
pub use entry::SubmitCallback;
pub use error::{Error, Result};
pub use stream::HealthListener;
