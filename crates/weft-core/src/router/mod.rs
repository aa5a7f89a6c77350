//! Map and reduce routers.
//!
//! A map router splits one envelope into tagged parts; a reduce router
//! accumulates parts keyed by request id until the declared count is
//! reached, merges them, and forwards exactly one envelope. An entry that
//! never completes is force-evicted after a configurable max age and
//! forwarded from whatever parts did arrive — the aggregation table must
//! never grow without bound.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, Payload, ScoredDoc, StageAck, VectorBlock};
use crate::stage::{Stage, StageError, StageOutput, StageRegistry, StageSpec};

/// Aggregation housekeeping knobs.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Maximum age of an incomplete aggregation before force-eviction.
    pub max_age: Duration,
    /// How long a completed request id is remembered so stragglers are
    /// recognized as stale instead of opening a fresh aggregation.
    pub completed_retention: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30),
            completed_retention: Duration::from_secs(60),
        }
    }
}

/// How a map router slices an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Split a `Documents` payload into batches of at most `batch_size`.
    FixedBatch {
        /// Maximum documents per part.
        batch_size: usize,
    },
    /// Clone the envelope into a fixed number of parts (replica fan-out).
    FanOut {
        /// Number of parts to stamp.
        parts: u32,
    },
}

/// How a reduce router merges a completed aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Group results by document id, sum scores, concatenate traces,
    /// re-sort descending. Acks merge by summing accepted counts.
    ScoreSum,
    /// Per ranked slot keep the first part that carries content, re-sort
    /// by score, truncate to `top_k`.
    BestFill {
        /// Result count cap after the merge.
        top_k: usize,
    },
    /// Concatenate vector fragments along the feature axis, ordered by
    /// shard index rather than arrival order.
    ConcatVectors,
}

/// Splits one envelope into `part_id`-tagged siblings.
pub struct MapRouter {
    policy: SplitPolicy,
}

impl MapRouter {
    /// Creates a map router with the given policy.
    #[must_use]
    pub fn new(policy: SplitPolicy) -> Self {
        Self { policy }
    }

    fn split(&self, env: Envelope) -> Vec<Envelope> {
        match &self.policy {
            SplitPolicy::FixedBatch { batch_size } => {
                let batch_size = (*batch_size).max(1);
                let Payload::Documents(docs) = &env.payload else {
                    // Nothing slicable; a single tagged part keeps the
                    // part stack balanced for the matching reduce.
                    let mut single = env;
                    single.push_parts(1, 1);
                    return vec![single];
                };
                let chunks: Vec<Vec<_>> =
                    docs.chunks(batch_size).map(<[_]>::to_vec).collect();
                let total = u32::try_from(chunks.len().max(1)).unwrap_or(u32::MAX);
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut part = env.clone();
                        part.payload = Payload::Documents(chunk);
                        part.push_parts(u32::try_from(i + 1).unwrap_or(u32::MAX), total);
                        part
                    })
                    .collect()
            }
            SplitPolicy::FanOut { parts } => {
                let total = (*parts).max(1);
                (1..=total)
                    .map(|i| {
                        let mut part = env.clone();
                        part.push_parts(i, total);
                        part
                    })
                    .collect()
            }
        }
    }
}

#[async_trait]
impl Stage for MapRouter {
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError> {
        let parts = self.split(env);
        if parts.len() == 1 {
            let mut parts = parts;
            return Ok(StageOutput::Forward(parts.remove(0)));
        }
        Ok(StageOutput::Fanout(parts))
    }
}

struct PendingEntry {
    parts: Vec<Envelope>,
    expected: u32,
    created_at: Instant,
}

/// Per-router aggregation counters, reported through the status protocol.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReduceStats {
    /// Aggregations completed and forwarded.
    pub completed: u64,
    /// Parts dropped because their count exceeded the declared total or
    /// duplicated an already-held part id.
    pub surplus_dropped: u64,
    /// Parts dropped because their request id had already completed.
    pub stale_dropped: u64,
    /// Incomplete aggregations force-evicted past max age.
    pub evicted: u64,
}

/// Accumulates parts by request id and merges them exactly once.
pub struct ReduceRouter {
    policy: MergePolicy,
    config: AggregationConfig,
    pending: FxHashMap<Uuid, PendingEntry>,
    completed: FxHashMap<Uuid, Instant>,
    stats: ReduceStats,
}

impl ReduceRouter {
    /// Creates a reduce router.
    #[must_use]
    pub fn new(policy: MergePolicy, config: AggregationConfig) -> Self {
        Self {
            policy,
            config,
            pending: FxHashMap::default(),
            completed: FxHashMap::default(),
            stats: ReduceStats::default(),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReduceStats {
        self.stats
    }

    /// Number of open aggregations.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn accumulate(&mut self, env: Envelope) -> Option<Envelope> {
        let request_id = env.request_id;
        if self.completed.contains_key(&request_id) {
            self.stats.stale_dropped += 1;
            warn!(%request_id, "part for completed aggregation dropped");
            return None;
        }
        let Some(level) = env.current_parts() else {
            // No part level: nothing to aggregate, forward as-is.
            return Some(env);
        };

        let entry = self
            .pending
            .entry(request_id)
            .or_insert_with(|| PendingEntry {
                parts: Vec::with_capacity(level.num_parts as usize),
                expected: level.num_parts,
                created_at: Instant::now(),
            });

        let duplicate = entry
            .parts
            .iter()
            .any(|held| held.current_parts().map(|p| p.part_id) == Some(level.part_id));
        if duplicate || entry.parts.len() >= entry.expected as usize {
            self.stats.surplus_dropped += 1;
            warn!(
                %request_id,
                part_id = level.part_id,
                expected = entry.expected,
                "surplus part dropped"
            );
            return None;
        }

        entry.parts.push(env);
        if entry.parts.len() < entry.expected as usize {
            return None;
        }

        let entry = self
            .pending
            .remove(&request_id)
            .unwrap_or_else(|| unreachable!("entry inserted above"));
        self.completed.insert(request_id, Instant::now());
        self.stats.completed += 1;
        Some(merge_parts(self.policy, entry.parts))
    }
}

#[async_trait]
impl Stage for ReduceRouter {
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError> {
        match self.accumulate(env) {
            Some(merged) => Ok(StageOutput::Forward(merged)),
            None => Ok(StageOutput::Pending),
        }
    }

    fn sweep(&mut self, now: Instant) -> Vec<Envelope> {
        self.completed
            .retain(|_, done_at| now.duration_since(*done_at) < self.config.completed_retention);

        let max_age = self.config.max_age;
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.created_at) >= max_age)
            .map(|(id, _)| *id)
            .collect();

        let mut flushed = Vec::with_capacity(expired.len());
        for request_id in expired {
            let Some(entry) = self.pending.remove(&request_id) else {
                continue;
            };
            warn!(
                %request_id,
                received = entry.parts.len(),
                expected = entry.expected,
                "aggregation stuck past max age; forwarding partial merge"
            );
            self.completed.insert(request_id, now);
            self.stats.evicted += 1;
            flushed.push(merge_parts(self.policy, entry.parts));
        }
        flushed
    }
}

/// Merges completed parts into one envelope.
///
/// The first-arrived part is the base: its route is the merged provenance
/// (all siblings share the upstream prefix; diverging sibling hops are
/// equivalent), and one part-stack level is popped for the nested
/// aggregation contract. Payload mismatches fall back to the base payload
/// with a warning — an aggregation error never crashes the router.
fn merge_parts(policy: MergePolicy, mut parts: Vec<Envelope>) -> Envelope {
    debug_assert!(!parts.is_empty());
    let mut base = parts.remove(0);
    base.pop_parts();

    let merged_payload = match policy {
        MergePolicy::ScoreSum => merge_score_sum(&base, &parts),
        MergePolicy::BestFill { top_k } => merge_best_fill(&base, &parts, top_k),
        MergePolicy::ConcatVectors => merge_concat(&base, &parts),
    };
    if let Some(payload) = merged_payload {
        base.payload = payload;
    } else if !parts.is_empty() {
        warn!(
            request_id = %base.request_id,
            "parts not mergeable under policy; keeping base payload"
        );
    }
    base
}

fn merge_score_sum(base: &Envelope, rest: &[Envelope]) -> Option<Payload> {
    match &base.payload {
        Payload::Results(_) => {
            let mut by_doc: FxHashMap<u64, ScoredDoc> = FxHashMap::default();
            for env in std::iter::once(base).chain(rest) {
                let Payload::Results(results) = &env.payload else {
                    continue;
                };
                for item in results {
                    by_doc
                        .entry(item.doc_id)
                        .and_modify(|held| {
                            held.score += item.score;
                            held.trace.extend(item.trace.iter().cloned());
                            if held.content.is_none() {
                                held.content = item.content.clone();
                            }
                        })
                        .or_insert_with(|| item.clone());
                }
            }
            let mut merged: Vec<ScoredDoc> = by_doc.into_values().collect();
            merged.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
            Some(Payload::Results(merged))
        }
        Payload::Ack(_) => {
            let mut stages = Vec::new();
            let mut accepted = 0usize;
            for env in std::iter::once(base).chain(rest) {
                let Payload::Ack(ack) = &env.payload else {
                    continue;
                };
                stages.extend(ack.stages.iter().cloned());
                accepted += ack.accepted;
            }
            Some(Payload::Ack(StageAck { stages, accepted }))
        }
        _ => None,
    }
}

fn merge_best_fill(base: &Envelope, rest: &[Envelope], top_k: usize) -> Option<Payload> {
    let Payload::Results(_) = &base.payload else {
        return None;
    };
    // Slot-by-slot: keep the first variant that carries content; each
    // shard may hold only a subset of the referenced documents.
    let mut by_doc: FxHashMap<u64, ScoredDoc> = FxHashMap::default();
    for env in std::iter::once(base).chain(rest) {
        let Payload::Results(results) = &env.payload else {
            continue;
        };
        for item in results {
            match by_doc.get_mut(&item.doc_id) {
                Some(held) => {
                    if held.content.is_none() && item.content.is_some() {
                        held.content = item.content.clone();
                        held.trace.extend(item.trace.iter().cloned());
                    }
                }
                None => {
                    by_doc.insert(item.doc_id, item.clone());
                }
            }
        }
    }
    let mut merged: Vec<ScoredDoc> = by_doc.into_values().collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
    merged.truncate(top_k);
    Some(Payload::Results(merged))
}

fn merge_concat(base: &Envelope, rest: &[Envelope]) -> Option<Payload> {
    let Payload::Vectors(_) = &base.payload else {
        return None;
    };
    let mut blocks: Vec<&VectorBlock> = std::iter::once(base)
        .chain(rest)
        .filter_map(|env| match &env.payload {
            Payload::Vectors(block) => Some(block),
            _ => None,
        })
        .collect();
    // Stable shard order, never arrival order.
    blocks.sort_by_key(|b| b.shard_index);
    let dims = blocks.iter().map(|b| b.dims).sum();
    let values = blocks.iter().flat_map(|b| b.values.iter().copied()).collect();
    Some(Payload::Vectors(VectorBlock {
        shard_index: blocks.first().map_or(0, |b| b.shard_index),
        dims,
        values,
    }))
}

/// Flat parameter table accepted by the `"router"` registry kind.
#[derive(Debug, Deserialize)]
struct RouterParams {
    mode: RouterMode,
    /// Map: split `Documents` into batches of this size.
    batch_size: Option<usize>,
    /// Map: clone into this many parts instead of batching.
    parts: Option<u32>,
    /// Reduce: merge discipline.
    merge: Option<MergeKind>,
    /// Reduce: result cap for `best_fill`.
    top_k: Option<usize>,
    /// Reduce: override the default eviction max age.
    max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RouterMode {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MergeKind {
    ScoreSum,
    BestFill,
    ConcatVectors,
}

impl RouterParams {
    fn build(self, defaults: &AggregationConfig) -> Result<Box<dyn Stage>, String> {
        match self.mode {
            RouterMode::Map => {
                let split = match (self.batch_size, self.parts) {
                    (Some(batch_size), None) => SplitPolicy::FixedBatch { batch_size },
                    (None, Some(parts)) => SplitPolicy::FanOut { parts },
                    (None, None) => {
                        return Err("map router needs batch_size or parts".to_string())
                    }
                    (Some(_), Some(_)) => {
                        return Err("map router takes batch_size or parts, not both".to_string())
                    }
                };
                Ok(Box::new(MapRouter::new(split)))
            }
            RouterMode::Reduce => {
                let merge = match self.merge.ok_or("reduce router needs a merge policy")? {
                    MergeKind::ScoreSum => MergePolicy::ScoreSum,
                    MergeKind::BestFill => MergePolicy::BestFill {
                        top_k: self.top_k.unwrap_or(10),
                    },
                    MergeKind::ConcatVectors => MergePolicy::ConcatVectors,
                };
                let mut config = defaults.clone();
                if let Some(ms) = self.max_age_ms {
                    config.max_age = Duration::from_millis(ms);
                }
                Ok(Box::new(ReduceRouter::new(merge, config)))
            }
        }
    }
}

/// Registers the `"router"` kind into a stage registry.
///
/// `defaults` seeds the aggregation config; a per-stage `max_age_ms`
/// parameter overrides the max age.
pub fn register(registry: &mut StageRegistry, defaults: &AggregationConfig) {
    let defaults = defaults.clone();
    registry.register(
        "router",
        Box::new(move |spec: &StageSpec| {
            let params =
                RouterParams::deserialize(&spec.params).map_err(|err| StageError::BadParams {
                    kind: spec.kind.clone(),
                    reason: err.to_string(),
                })?;
            params.build(&defaults).map_err(|reason| StageError::BadParams {
                kind: spec.kind.clone(),
                reason,
            })
        }),
    );
    debug!("router stage kind registered");
}
