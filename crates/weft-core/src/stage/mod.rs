//! Stage plugin interface, registry, and middleware.
//!
//! A stage is the pluggable transform a runtime applies to each envelope.
//! Stage kinds are a closed set resolved once at topology-load time
//! through an explicit [`StageRegistry`] — an object constructed at
//! process start and passed by reference, never a module-level singleton.

use std::time::Instant;

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope::Envelope;

pub mod builtin;

/// What a stage asks the runtime to do after handling one envelope.
///
/// The explicit three-state shape replaces suspension-based streaming
/// handlers: the runtime forwards `Forward`/`Fanout`, holds its tongue on
/// `Pending` (aggregation backpressure), and counts `Dropped`.
#[derive(Debug)]
pub enum StageOutput {
    /// Forward one envelope downstream.
    Forward(Envelope),
    /// Forward several envelopes downstream (map split).
    Fanout(Vec<Envelope>),
    /// Nothing to forward yet; the stage is holding state for this
    /// request (reduce backpressure). Not an error.
    Pending,
    /// The envelope was consumed and intentionally discarded.
    Dropped,
}

/// Errors raised by stage implementations.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// `apply` failed on one envelope.
    #[error("apply failed: {0}")]
    Apply(String),

    /// `train` failed on one batch.
    #[error("train failed: {0}")]
    Train(String),

    /// Flushing stage state failed.
    #[error("flush failed: {0}")]
    Flush(String),

    /// The registry has no factory for the requested kind.
    #[error("unknown stage kind: {0}")]
    UnknownKind(String),

    /// Stage parameters failed to deserialize.
    #[error("bad stage params for '{kind}': {reason}")]
    BadParams {
        /// Stage kind.
        kind: String,
        /// What was wrong.
        reason: String,
    },
}

/// Declarative description of a stage instance: its registry kind plus
/// kind-specific parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpec {
    /// Registry kind name (e.g. `"indexer"`).
    pub kind: String,
    /// Kind-specific parameters, deserialized by the factory.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageSpec {
    /// Creates a spec with no parameters.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Value::Null,
        }
    }

    /// Creates a spec with parameters.
    #[must_use]
    pub fn with_params(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// The pluggable transform a runtime applies to envelopes.
#[async_trait]
pub trait Stage: Send {
    /// Handles one envelope.
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError>;

    /// Consumes one training batch. Only called when
    /// [`is_trainable`](Self::is_trainable) returns true.
    async fn train(&mut self, _batch: &Envelope) -> Result<(), StageError> {
        Ok(())
    }

    /// Whether this stage follows the two-phase train-then-apply contract.
    fn is_trainable(&self) -> bool {
        false
    }

    /// Persists internal state. Invoked by the runtime on its auto-flush
    /// interval; errors are logged, never fatal.
    fn flush(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Periodic housekeeping hook. A reduce router returns force-evicted
    /// partial merges here; most stages return nothing.
    fn sweep(&mut self, _now: Instant) -> Vec<Envelope> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Stage")
    }
}

/// Factory closure building a stage from its spec.
pub type StageFactory =
    Box<dyn Fn(&StageSpec) -> Result<Box<dyn Stage>, StageError> + Send + Sync>;

/// Explicit stage registry: kind name to factory.
pub struct StageRegistry {
    factories: FxHashMap<String, StageFactory>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Creates a registry pre-loaded with the builtin stage kinds.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Registers (or replaces) a factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: StageFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Builds a stage instance from its spec.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::UnknownKind`] when no factory matches, or the
    /// factory's own error.
    pub fn build(&self, spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| StageError::UnknownKind(spec.kind.clone()))?;
        factory(spec)
    }

    /// Returns whether a kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency-logging middleware.
///
/// Wraps any stage and logs per-call `apply`/`train` duration. Composed
/// explicitly at construction time by the supervisor when profiling is
/// enabled; implements the same interface it wraps.
pub struct Timed {
    inner: Box<dyn Stage>,
    label: String,
}

impl Timed {
    /// Wraps `inner`, tagging log lines with `label`.
    #[must_use]
    pub fn wrap(label: impl Into<String>, inner: Box<dyn Stage>) -> Box<dyn Stage> {
        Box::new(Self {
            inner,
            label: label.into(),
        })
    }
}

#[async_trait]
impl Stage for Timed {
    async fn apply(&mut self, env: Envelope) -> Result<StageOutput, StageError> {
        let started = Instant::now();
        let result = self.inner.apply(env).await;
        debug!(
            stage = %self.label,
            elapsed_us = started.elapsed().as_micros() as u64,
            "apply timed"
        );
        result
    }

    async fn train(&mut self, batch: &Envelope) -> Result<(), StageError> {
        let started = Instant::now();
        let result = self.inner.train(batch).await;
        debug!(
            stage = %self.label,
            elapsed_us = started.elapsed().as_micros() as u64,
            "train timed"
        );
        result
    }

    fn is_trainable(&self) -> bool {
        self.inner.is_trainable()
    }

    fn flush(&mut self) -> Result<(), StageError> {
        self.inner.flush()
    }

    fn sweep(&mut self, now: Instant) -> Vec<Envelope> {
        self.inner.sweep(now)
    }
}
