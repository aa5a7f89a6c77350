//! Flow-level error type.

use uuid::Uuid;

use weft_core::envelope::WireError;
use weft_core::runtime::RuntimeError;
use weft_core::stage::StageError;
use weft_core::transport::TransportError;

use crate::topology::TopologyError;

/// Errors surfaced by deployment and the client boundary.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Graph compilation failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// A runtime failed to start or stop.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Building a stage from the registry failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// An envelope failed to encode or decode.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The compiled flow is missing frontend endpoints.
    #[error("compiled flow has no frontend endpoints")]
    MissingFrontendEndpoints,

    /// The configured host does not parse as an address.
    #[error("bad flow host '{host}': {source}")]
    BadHost {
        /// The offending host string.
        host: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// No reply arrived for a request before its deadline.
    #[error("request {0} timed out waiting for a reply")]
    RequestTimeout(Uuid),

    /// The reply slot was dropped before a reply arrived.
    #[error("reply channel closed for request {0}")]
    ReplyChannelClosed(Uuid),
}
