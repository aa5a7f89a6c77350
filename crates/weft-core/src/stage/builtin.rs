//! Builtin example stages.
//!
//! These are deliberately small collaborators that make a compiled flow
//! runnable end to end: a whitespace-normalizing preprocessor, a feature
//! hashing encoder (trainable on document frequencies), and an in-memory
//! indexer. The numerical sophistication of real encoders and indexes
//! lives behind the same [`Stage`] trait and is out of scope here.

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::envelope::{Document, Envelope, Payload, ScoredDoc, StageAck};

use super::{Stage, StageError, StageOutput, StageRegistry, StageSpec};

/// Registers every builtin kind into `registry`.
pub fn register(registry: &mut StageRegistry) {
    registry.register("passthrough", Box::new(|_spec| Ok(Box::new(Passthrough))));
    registry.register(
        "preprocessor",
        Box::new(|_spec| Ok(Box::new(TextPreprocessor))),
    );
    registry.register(
        "encoder",
        Box::new(|spec| {
            let params = EncoderParams::from_spec(spec)?;
            Ok(Box::new(HashEncoder::new(params.dims)))
        }),
    );
    registry.register(
        "indexer",
        Box::new(|spec| {
            let params = IndexerParams::from_spec(spec)?;
            Ok(Box::new(MemoryIndexer::new(params.label, params.mode)))
        }),
    );
}

fn parse_params<'de, T: Deserialize<'de> + Default>(
    spec: &'de StageSpec,
) -> Result<T, StageError> {
    if spec.params.is_null() {
        return Ok(T::default());
    }
    T::deserialize(&spec.params).map_err(|err| StageError::BadParams {
        kind: spec.kind.clone(),
        reason: err.to_string(),
    })
}

/// Forwards every envelope unchanged.
pub struct Passthrough;

#[async_trait]
impl Stage for Passthrough {
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError> {
        Ok(StageOutput::Forward(env))
    }
}

/// Whitespace-normalizing document preprocessor.
///
/// `Documents` are trimmed and their whitespace collapsed; a `Blob` is
/// decoded as UTF-8 and split into one document per non-empty line;
/// queries are trimmed. Anything else passes through.
pub struct TextPreprocessor;

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Stage for TextPreprocessor {
    async fn apply(&mut self, mut env: Envelope) -> Result<StageOutput, StageError> {
        match env.payload {
            Payload::Documents(ref mut docs) => {
                for doc in docs.iter_mut() {
                    doc.content = normalize(&doc.content);
                }
            }
            Payload::Blob(ref blob) => {
                let text = String::from_utf8_lossy(blob);
                let docs: Vec<Document> = text
                    .lines()
                    .map(normalize)
                    .filter(|line| !line.is_empty())
                    .enumerate()
                    .map(|(i, content)| Document {
                        doc_id: i as u64,
                        content,
                        embedding: None,
                    })
                    .collect();
                env.payload = Payload::Documents(docs);
            }
            Payload::Query(ref mut query) => {
                query.text = normalize(&query.text);
            }
            _ => {}
        }
        Ok(StageOutput::Forward(env))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EncoderParams {
    dims: usize,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self { dims: 64 }
    }
}

impl EncoderParams {
    fn from_spec(spec: &StageSpec) -> Result<Self, StageError> {
        parse_params(spec)
    }
}

/// Feature-hashing encoder.
///
/// Tokens are hashed into a fixed number of buckets; when trained, bucket
/// weights are scaled by an inverse-document-frequency estimate collected
/// from `Train` batches. Untrained, it degrades to plain term counts.
pub struct HashEncoder {
    dims: usize,
    doc_freq: FxHashMap<u64, u32>,
    trained_docs: u32,
}

impl HashEncoder {
    /// Creates an untrained encoder with the given dimensionality.
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            doc_freq: FxHashMap::default(),
            trained_docs: 0,
        }
    }

    fn bucket(&self, token: &str) -> u64 {
        fxhash::hash64(token) % self.dims as u64
    }

    fn weight(&self, bucket: u64) -> f32 {
        if self.trained_docs == 0 {
            return 1.0;
        }
        let df = self.doc_freq.get(&bucket).copied().unwrap_or(0) + 1;
        ((f64::from(self.trained_docs) + 1.0) / f64::from(df)).ln() as f32 + 1.0
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        for token in text.split_whitespace() {
            let bucket = self.bucket(&token.to_lowercase());
            vector[bucket as usize] += self.weight(bucket);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Stage for HashEncoder {
    async fn apply(&mut self, mut env: Envelope) -> Result<StageOutput, StageError> {
        match env.payload {
            Payload::Documents(ref mut docs) => {
                for doc in docs.iter_mut() {
                    doc.embedding = Some(self.encode(&doc.content));
                }
            }
            Payload::Query(ref mut query) => {
                query.embedding = Some(self.encode(&query.text));
            }
            _ => {}
        }
        Ok(StageOutput::Forward(env))
    }

    async fn train(&mut self, batch: &Envelope) -> Result<(), StageError> {
        let Payload::Documents(docs) = &batch.payload else {
            return Ok(());
        };
        for doc in docs {
            let mut seen = std::collections::HashSet::new();
            for token in doc.content.split_whitespace() {
                let bucket = self.bucket(&token.to_lowercase());
                if seen.insert(bucket) {
                    *self.doc_freq.entry(bucket).or_insert(0) += 1;
                }
            }
            self.trained_docs += 1;
        }
        debug!(docs = self.trained_docs, "encoder document frequencies updated");
        Ok(())
    }

    fn is_trainable(&self) -> bool {
        true
    }
}

/// Scoring mode of the in-memory indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerMode {
    /// Term-overlap scoring; results carry document content.
    #[default]
    Content,
    /// Cosine scoring over embeddings; results carry scores only.
    Vector,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndexerParams {
    label: Option<String>,
    mode: IndexerMode,
}

impl IndexerParams {
    fn from_spec(spec: &StageSpec) -> Result<Self, StageError> {
        parse_params(spec)
    }
}

/// In-memory indexer: stores documents, answers queries, acks writes.
pub struct MemoryIndexer {
    label: String,
    mode: IndexerMode,
    docs: FxHashMap<u64, Document>,
}

impl MemoryIndexer {
    /// Creates an empty indexer.
    #[must_use]
    pub fn new(label: Option<String>, mode: IndexerMode) -> Self {
        Self {
            label: label.unwrap_or_else(|| "indexer".to_string()),
            mode,
            docs: FxHashMap::default(),
        }
    }

    fn score(&self, query: &crate::envelope::SearchQuery, doc: &Document) -> f32 {
        match self.mode {
            IndexerMode::Content => {
                let needle: Vec<&str> = query.text.split_whitespace().collect();
                if needle.is_empty() {
                    return 0.0;
                }
                let hits = needle
                    .iter()
                    .filter(|t| doc.content.to_lowercase().contains(&t.to_lowercase()))
                    .count();
                hits as f32 / needle.len() as f32
            }
            IndexerMode::Vector => match (&query.embedding, &doc.embedding) {
                (Some(q), Some(d)) if q.len() == d.len() => {
                    q.iter().zip(d.iter()).map(|(a, b)| a * b).sum()
                }
                _ => 0.0,
            },
        }
    }
}

#[async_trait]
impl Stage for MemoryIndexer {
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError> {
        match &env.payload {
            Payload::Documents(docs) => {
                for doc in docs {
                    self.docs.insert(doc.doc_id, doc.clone());
                }
                let ack = env.reply(Payload::Ack(StageAck {
                    stages: vec![self.label.clone()],
                    accepted: docs.len(),
                }));
                Ok(StageOutput::Forward(ack))
            }
            Payload::Query(query) => {
                let mut results: Vec<ScoredDoc> = self
                    .docs
                    .values()
                    .map(|doc| {
                        let score = self.score(query, doc);
                        ScoredDoc {
                            doc_id: doc.doc_id,
                            score,
                            content: match self.mode {
                                IndexerMode::Content => Some(doc.content.clone()),
                                IndexerMode::Vector => None,
                            },
                            trace: vec![format!("{}:{score:.3}", self.label)],
                        }
                    })
                    .filter(|r| r.score > 0.0)
                    .collect();
                results.sort_by(|a, b| b.score.total_cmp(&a.score));
                results.truncate(query.top_k);
                Ok(StageOutput::Forward(env.reply(Payload::Results(results))))
            }
            _ => Ok(StageOutput::Forward(env)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SearchQuery;

    fn doc(id: u64, content: &str) -> Document {
        Document {
            doc_id: id,
            content: content.to_string(),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn test_preprocessor_normalizes_whitespace() {
        let mut prep = TextPreprocessor;
        let env = Envelope::request(
            "c",
            Payload::Documents(vec![doc(1, "  hello\t\tweft \n world ")]),
        );
        let out = prep.apply(env).await.unwrap();
        let StageOutput::Forward(env) = out else {
            panic!("expected forward")
        };
        let Payload::Documents(docs) = env.payload else {
            panic!("expected documents")
        };
        assert_eq!(docs[0].content, "hello weft world");
    }

    #[tokio::test]
    async fn test_preprocessor_splits_blob_lines() {
        let mut prep = TextPreprocessor;
        let env = Envelope::request(
            "c",
            Payload::Blob(bytes::Bytes::from_static(b"first line\n\nsecond  line\n")),
        );
        let StageOutput::Forward(env) = prep.apply(env).await.unwrap() else {
            panic!("expected forward")
        };
        let Payload::Documents(docs) = env.payload else {
            panic!("expected documents")
        };
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].content, "second line");
    }

    #[tokio::test]
    async fn test_encoder_attaches_normalized_embeddings() {
        let mut enc = HashEncoder::new(16);
        let env = Envelope::request("c", Payload::Documents(vec![doc(1, "alpha beta")]));
        let StageOutput::Forward(env) = enc.apply(env).await.unwrap() else {
            panic!("expected forward")
        };
        let Payload::Documents(docs) = env.payload else {
            panic!("expected documents")
        };
        let embedding = docs[0].embedding.as_ref().unwrap();
        assert_eq!(embedding.len(), 16);
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_encoder_training_shifts_weights() {
        let mut enc = HashEncoder::new(32);
        assert!(enc.is_trainable());
        let batch = Envelope::request(
            "c",
            Payload::Documents(vec![doc(1, "common rare"), doc(2, "common")]),
        );
        enc.train(&batch).await.unwrap();
        assert_eq!(enc.trained_docs, 2);
        // A token seen in every document weighs less than a rare one.
        let common_w = enc.weight(enc.bucket("common"));
        let rare_w = enc.weight(enc.bucket("rare"));
        assert!(rare_w > common_w);
    }

    #[tokio::test]
    async fn test_indexer_acks_writes_and_answers_queries() {
        let mut idx = MemoryIndexer::new(Some("doc_idx".to_string()), IndexerMode::Content);
        let write = Envelope::request(
            "c",
            Payload::Documents(vec![doc(1, "the quick brown fox"), doc(2, "lazy dog")]),
        );
        let StageOutput::Forward(ack) = idx.apply(write).await.unwrap() else {
            panic!("expected forward")
        };
        let Payload::Ack(ack) = &ack.payload else {
            panic!("expected ack")
        };
        assert_eq!(ack.accepted, 2);
        assert_eq!(ack.stages, ["doc_idx"]);

        let query = Envelope::request(
            "c",
            Payload::Query(SearchQuery {
                text: "quick fox".to_string(),
                top_k: 5,
                embedding: None,
            }),
        );
        let StageOutput::Forward(resp) = idx.apply(query).await.unwrap() else {
            panic!("expected forward")
        };
        let Payload::Results(results) = resp.payload else {
            panic!("expected results")
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, 1);
        assert_eq!(results[0].content.as_deref(), Some("the quick brown fox"));
    }

    #[tokio::test]
    async fn test_unknown_payload_passes_through() {
        let mut idx = MemoryIndexer::new(None, IndexerMode::Content);
        let env = Envelope::request("c", Payload::Json("{}".to_string()));
        let StageOutput::Forward(out) = idx.apply(env.clone()).await.unwrap() else {
            panic!("expected forward")
        };
        assert_eq!(out, env);
    }
}
