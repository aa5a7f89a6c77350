//! Wire codec for envelopes.
//!
//! An envelope travels as a bincode body inside a 4-byte little-endian
//! length-prefixed frame (the frame itself is written by the transport
//! layer). Encoding then decoding yields byte-identical header fields and
//! payload.

use bytes::Bytes;

use super::Envelope;

/// Errors raised by the envelope codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Serialization failed.
    #[error("envelope encode failed: {0}")]
    Encode(bincode::Error),

    /// Deserialization failed (corrupt or foreign frame).
    #[error("envelope decode failed: {0}")]
    Decode(bincode::Error),
}

/// Encodes an envelope into its wire body.
///
/// # Errors
///
/// Returns [`WireError::Encode`] when serialization fails.
pub fn encode_envelope(env: &Envelope) -> Result<Bytes, WireError> {
    bincode::serialize(env)
        .map(Bytes::from)
        .map_err(WireError::Encode)
}

/// Decodes an envelope from a wire body.
///
/// # Errors
///
/// Returns [`WireError::Decode`] when the bytes are not a valid envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    bincode::deserialize(body).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;
    use crate::envelope::{Envelope, EnvelopeKind, Hop, Payload};

    fn sample() -> Envelope {
        let mut env = Envelope {
            client_id: "client-7".to_string(),
            request_id: Uuid::new_v4(),
            parts: smallvec::smallvec![],
            route: vec![Hop {
                stage: "prep".to_string(),
                at_ms: 1_722_000_000_123,
            }],
            timeout: Duration::from_millis(2500),
            kind: EnvelopeKind::Request,
            payload: Payload::Blob(Bytes::from_static(b"\x00\x01\xff opaque body")),
        };
        env.push_parts(2, 5);
        env.push_parts(1, 2);
        env
    }

    #[test]
    fn test_round_trip_is_byte_faithful() {
        let env = sample();
        let body = encode_envelope(&env).unwrap();
        let back = decode_envelope(&body).unwrap();
        assert_eq!(back, env);
        // Re-encoding the decoded envelope must reproduce the same bytes.
        let body2 = encode_envelope(&back).unwrap();
        assert_eq!(body, body2);
    }

    #[test]
    fn test_round_trip_every_payload_variant() {
        use crate::envelope::{Document, ScoredDoc, SearchQuery, StageAck, VectorBlock};

        let payloads = vec![
            Payload::Empty,
            Payload::Blob(Bytes::from_static(b"raw")),
            Payload::Json(r#"{"k":[1,2,3]}"#.to_string()),
            Payload::Documents(vec![Document {
                doc_id: 9,
                content: "hello weft".to_string(),
                embedding: Some(vec![0.5, -1.0]),
            }]),
            Payload::Query(SearchQuery {
                text: "needle".to_string(),
                top_k: 10,
                embedding: None,
            }),
            Payload::Results(vec![ScoredDoc {
                doc_id: 9,
                score: 0.75,
                content: None,
                trace: vec!["idx:0.75".to_string()],
            }]),
            Payload::Vectors(VectorBlock {
                shard_index: 3,
                dims: 2,
                values: vec![1.0, 2.0, 3.0, 4.0],
            }),
            Payload::Ack(StageAck {
                stages: vec!["doc_idx".to_string()],
                accepted: 3,
            }),
        ];

        for payload in payloads {
            let mut env = sample();
            env.payload = payload;
            let back = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();
            assert_eq!(back, env);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_envelope(&[0xde, 0xad, 0xbe, 0xef]),
            Err(WireError::Decode(_))
        ));
    }
}
