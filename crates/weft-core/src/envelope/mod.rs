//! The routed message unit exchanged between stages.
//!
//! An [`Envelope`] carries a stage-specific payload plus the routing header:
//! client/request identifiers, the part stack written by map routers and
//! consumed by reduce routers, the hop trace, and the send-side timeout.
//! The payload is opaque to the routing layer; a stage that does not
//! understand a payload variant passes it through unmodified.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod wire;

pub use wire::{decode_envelope, encode_envelope, WireError};

/// Default send-side timeout for a freshly constructed envelope.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope kinds understood by the runtime dispatcher.
///
/// `Status` and `Terminate` are reserved for the control channel and are
/// never dispatched to a stage on the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A client request travelling towards the indexers.
    Request,
    /// A response (or partial response) travelling back to the frontend.
    Response,
    /// A training batch for trainable stages.
    Train,
    /// Control: report runtime statistics.
    Status,
    /// Control: stop the event loop. The only fatal-by-design kind.
    Terminate,
}

impl EnvelopeKind {
    /// Returns whether this kind belongs to the control protocol.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Status | Self::Terminate)
    }
}

/// One level of the part stack: this envelope is part `part_id` of
/// `num_parts` siblings produced by the most recent map split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// 1-based index among the siblings of this level.
    pub part_id: u32,
    /// Total sibling count of this level.
    pub num_parts: u32,
}

/// One hop in the route trace: which stage handled the envelope, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Stage instance name.
    pub stage: String,
    /// Unix timestamp in milliseconds at forward time.
    pub at_ms: u64,
}

/// A document flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned document identifier.
    pub doc_id: u64,
    /// Raw or normalized text content.
    pub content: String,
    /// Feature vector attached by an encoder stage, if any.
    pub embedding: Option<Vec<f32>>,
}

/// A search query travelling towards the indexers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Query text.
    pub text: String,
    /// Number of results the caller wants back.
    pub top_k: usize,
    /// Query embedding attached by an encoder stage, if any.
    pub embedding: Option<Vec<f32>>,
}

/// One scored result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDoc {
    /// Document identifier.
    pub doc_id: u64,
    /// Relevance score; higher is better.
    pub score: f32,
    /// Document content, when the answering shard holds it.
    pub content: Option<String>,
    /// Explanation trace, concatenated across merges.
    pub trace: Vec<String>,
}

/// A block of vectors produced by an encoder shard.
///
/// `shard_index` defines the concatenation order for reduce routers that
/// reassemble fragments along the feature axis; arrival order does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorBlock {
    /// Stable shard index of the producing replica.
    pub shard_index: u32,
    /// Feature dimensionality of this fragment.
    pub dims: usize,
    /// Row-major values, `rows * dims` long.
    pub values: Vec<f32>,
}

/// Acknowledgement emitted by a write-path stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAck {
    /// Names of the stages that acknowledged, in merge order.
    pub stages: Vec<String>,
    /// Number of items accepted.
    pub accepted: usize,
}

/// The stage-specific envelope body.
///
/// An explicit tagged union: the variant is part of the wire format, never
/// a side-channel content-type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Nothing. Used by control acknowledgements.
    Empty,
    /// An opaque blob the routing layer never inspects.
    Blob(Bytes),
    /// JSON text, used by the status protocol. Kept as text because the
    /// binary wire codec is not self-describing.
    Json(String),
    /// A batch of documents (index or train path).
    Documents(Vec<Document>),
    /// A search query.
    Query(SearchQuery),
    /// Scored results travelling back to the frontend.
    Results(Vec<ScoredDoc>),
    /// Encoder output fragments.
    Vectors(VectorBlock),
    /// A write acknowledgement.
    Ack(StageAck),
}

/// Errors raised by envelope header validation.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A part-stack level violates `1 <= part_id <= num_parts`.
    #[error("invalid part level: part {part_id} of {num_parts}")]
    InvalidPart {
        /// Offending part id.
        part_id: u32,
        /// Declared sibling count.
        num_parts: u32,
    },
}

/// The message unit exchanged between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque client identifier, carried end to end.
    pub client_id: String,
    /// Request identifier; the aggregation key for reduce routers.
    pub request_id: Uuid,
    /// Part stack; nested map/reduce pairs push and pop levels.
    pub parts: SmallVec<[PartInfo; 2]>,
    /// Ordered hops already traversed. Append-only.
    pub route: Vec<Hop>,
    /// How long the sender is willing to wait for delivery; enforced by
    /// the transport on the sending side.
    pub timeout: Duration,
    /// Dispatch kind.
    pub kind: EnvelopeKind,
    /// Stage-specific body.
    pub payload: Payload,
}

impl Envelope {
    /// Creates a fresh request envelope with a random request id.
    #[must_use]
    pub fn request(client_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            client_id: client_id.into(),
            request_id: Uuid::new_v4(),
            parts: SmallVec::new(),
            route: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            kind: EnvelopeKind::Request,
            payload,
        }
    }

    /// Creates a control envelope of the given kind, addressed to nobody
    /// in particular.
    #[must_use]
    pub fn control(kind: EnvelopeKind) -> Self {
        Self {
            client_id: String::new(),
            request_id: Uuid::new_v4(),
            parts: SmallVec::new(),
            route: Vec::new(),
            timeout: Duration::from_secs(5),
            kind,
            payload: Payload::Empty,
        }
    }

    /// Builds the reply to this envelope: same identifiers and part stack,
    /// `Response` kind, new payload.
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            client_id: self.client_id.clone(),
            request_id: self.request_id,
            parts: self.parts.clone(),
            route: self.route.clone(),
            timeout: self.timeout,
            kind: EnvelopeKind::Response,
            payload,
        }
    }

    /// Appends a hop for `stage` stamped with the current wall clock.
    pub fn record_hop(&mut self, stage: &str) {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.route.push(Hop {
            stage: stage.to_string(),
            at_ms,
        });
    }

    /// Pushes one part level, marking this envelope as part `part_id` of
    /// `num_parts` siblings.
    pub fn push_parts(&mut self, part_id: u32, num_parts: u32) {
        self.parts.push(PartInfo { part_id, num_parts });
    }

    /// Pops the innermost part level, if any.
    pub fn pop_parts(&mut self) -> Option<PartInfo> {
        self.parts.pop()
    }

    /// Returns the innermost part level, if any.
    #[must_use]
    pub fn current_parts(&self) -> Option<PartInfo> {
        self.parts.last().copied()
    }

    /// Checks the part-stack invariant on every level.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidPart`] for the first level where
    /// `part_id` falls outside `[1, num_parts]`.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        for level in &self.parts {
            if level.part_id == 0 || level.part_id > level.num_parts {
                return Err(EnvelopeError::InvalidPart {
                    part_id: level.part_id,
                    num_parts: level.num_parts,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let env = Envelope::request("cli", Payload::Empty);
        assert_eq!(env.kind, EnvelopeKind::Request);
        assert!(env.parts.is_empty());
        assert!(env.route.is_empty());
        assert_eq!(env.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_reply_keeps_identifiers() {
        let mut env = Envelope::request("cli", Payload::Empty);
        env.push_parts(2, 3);
        let reply = env.reply(Payload::Ack(StageAck {
            stages: vec!["idx".to_string()],
            accepted: 1,
        }));
        assert_eq!(reply.request_id, env.request_id);
        assert_eq!(reply.client_id, "cli");
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.current_parts(), Some(PartInfo { part_id: 2, num_parts: 3 }));
    }

    #[test]
    fn test_part_stack_push_pop() {
        let mut env = Envelope::request("cli", Payload::Empty);
        env.push_parts(1, 4);
        env.push_parts(2, 2);
        assert_eq!(env.current_parts(), Some(PartInfo { part_id: 2, num_parts: 2 }));
        assert_eq!(env.pop_parts(), Some(PartInfo { part_id: 2, num_parts: 2 }));
        assert_eq!(env.current_parts(), Some(PartInfo { part_id: 1, num_parts: 4 }));
    }

    #[test]
    fn test_validate_rejects_zero_part_id() {
        let mut env = Envelope::request("cli", Payload::Empty);
        env.push_parts(0, 2);
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::InvalidPart { part_id: 0, num_parts: 2 })
        ));
    }

    #[test]
    fn test_validate_rejects_part_id_past_num_parts() {
        let mut env = Envelope::request("cli", Payload::Empty);
        env.push_parts(3, 2);
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_record_hop_appends() {
        let mut env = Envelope::request("cli", Payload::Empty);
        env.record_hop("prep");
        env.record_hop("encoder");
        let names: Vec<&str> = env.route.iter().map(|h| h.stage.as_str()).collect();
        assert_eq!(names, ["prep", "encoder"]);
    }

    #[test]
    fn test_control_kinds() {
        assert!(EnvelopeKind::Terminate.is_control());
        assert!(EnvelopeKind::Status.is_control());
        assert!(!EnvelopeKind::Request.is_control());
        assert!(!EnvelopeKind::Train.is_control());
    }
}
