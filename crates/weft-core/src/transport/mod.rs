//! Transport socket abstraction.
//!
//! Four communication patterns over TCP with length-prefixed frames:
//!
//! - **Exclusive pair**: one producer, one consumer, either side may bind
//! - **Broadcast**: the producer binds a publish endpoint; every consumer
//!   connects and receives a full copy of every frame
//! - **Load-balanced**: push/pull. Either the single consumer binds and
//!   fair-merges frames from many connected pushers (funnel), or the
//!   single producer binds and round-robins frames across many connected
//!   replica consumers (distribute)
//! - **Control pair**: request/ack framing, always bound locally by the
//!   runtime being controlled
//!
//! Connect sides retry with capped exponential backoff, so the start order
//! of a deployed flow does not matter. The envelope's `timeout` is
//! enforced here on the sending side; the receiving runtime never cancels
//! in-flight work.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::WireError;

mod control;
mod frame;
mod retry;
mod socket;

pub use control::{ControlChannel, ControlClient, ControlRequest};
pub use retry::ConnectRetry;
pub use socket::{DataInbound, DataOutbound};

#[cfg(test)]
pub(crate) use socket::test_addr;

/// The resolved transport pattern of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPattern {
    /// Exclusive point-to-point pair.
    Exclusive,
    /// One producer, many consumers, full copies.
    Broadcast,
    /// Push/pull with fair dispatch across the many side.
    LoadBalanced,
}

/// Which fan discipline a binding producer applies to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    /// Exactly one peer (pair).
    Single,
    /// Clone every frame to every live peer.
    Broadcast,
    /// Rotate frames across live peers.
    RoundRobin,
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hard cap on a single frame body; larger frames are rejected before
    /// allocation.
    pub max_frame_bytes: usize,
    /// Connect retry policy.
    pub retry: ConnectRetry,
    /// Bounded depth of per-peer and merge queues.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
            retry: ConnectRetry::default(),
            queue_depth: 1024,
        }
    }
}

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding a listener failed.
    #[error("bind {addr} failed: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Connecting to a peer failed after all retries.
    #[error("connect {addr} failed after {attempts} attempts: {source}")]
    Connect {
        /// The peer address.
        addr: SocketAddr,
        /// Attempts made, counting the first.
        attempts: usize,
        /// Last io error observed.
        source: std::io::Error,
    },

    /// A read or write on an established connection failed.
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    /// The send-side deadline elapsed before delivery.
    #[error("send timed out after {after:?}")]
    Timeout {
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The peer set is gone; nothing can be delivered.
    #[error("transport closed: no live peers")]
    Closed,

    /// A frame exceeded the configured cap.
    #[error("frame of {len} bytes exceeds cap of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// The frame body was not a valid envelope.
    #[error(transparent)]
    Wire(#[from] WireError),
}
