//! Declarative flow configuration.
//!
//! A flow file is TOML: flow-wide knobs plus one `[[stage]]` table per
//! stage with its neighbors, replica count, income preference, and
//! kind-specific parameters. `weftd` loads one of these, compiles it, and
//! deploys the result.
//!
//! ```toml
//! name = "search"
//! host = "127.0.0.1"
//! port_base = 47000
//!
//! [[stage]]
//! name = "frontend"
//! kind = "frontend"
//! outgoing = ["prep"]
//!
//! [[stage]]
//! name = "prep"
//! kind = "preprocessor"
//! outgoing = ["encoder"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use weft_core::router::AggregationConfig;
use weft_core::stage::StageSpec;

use crate::supervisor::DeployOptions;
use crate::topology::{
    CompileOptions, IncomePolicy, NodeKind, ServiceGraph, ServiceNode, TopologyError,
};

/// Errors raised while loading a flow file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("flow config read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse.
    #[error("flow config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One `[[stage]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Stage kind.
    pub kind: NodeKind,
    /// Instance count.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Inbound delivery preference.
    #[serde(default)]
    pub income: IncomePolicy,
    /// Downstream neighbor names.
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Upstream neighbor names (either side may declare an edge).
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Registry kind override; defaults per stage kind.
    #[serde(default)]
    pub stage_kind: Option<String>,
    /// Kind-specific parameters, handed to the stage factory.
    #[serde(default)]
    pub params: Option<toml::Value>,
}

fn default_replicas() -> u32 {
    1
}

/// Flow-wide aggregation table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AggregationSection {
    /// Max age of an incomplete aggregation, in milliseconds.
    pub max_age_ms: Option<u64>,
    /// Retention of completed request ids, in milliseconds.
    pub completed_retention_ms: Option<u64>,
}

/// The parsed flow file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    /// Flow name.
    pub name: String,
    /// Host every endpoint lives on.
    #[serde(default = "default_host")]
    pub host: String,
    /// First port of the allocation range.
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    /// Size of the allocation range.
    #[serde(default = "default_port_span")]
    pub port_span: u16,
    /// Wrap every stage in the latency-logging middleware.
    #[serde(default)]
    pub profiling: bool,
    /// Auto-persistence interval in milliseconds; 0 or absent disables.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    /// Sweep tick interval in milliseconds.
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
    /// Aggregation defaults.
    #[serde(default)]
    pub aggregation: AggregationSection,
    /// The stages.
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_base() -> u16 {
    47_000
}

fn default_port_span() -> u16 {
    512
}

fn default_sweep_ms() -> u64 {
    500
}

impl FlowConfig {
    /// Parses a flow file from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a flow file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Builds the abstract service graph.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateNode`] for repeated stage names.
    pub fn graph(&self) -> Result<ServiceGraph, TopologyError> {
        let mut graph = ServiceGraph::new(self.name.clone());
        for stage in &self.stages {
            let mut node = ServiceNode::new(stage.name.clone(), stage.kind);
            node.replicas = stage.replicas;
            node.income = stage.income;
            node.outgoing = stage.outgoing.clone();
            node.upstream = stage.upstream.clone();
            node.stage = stage_spec(stage);
            graph.add_node(node)?;
        }
        Ok(graph)
    }

    /// Compilation options derived from the flow-wide knobs.
    #[must_use]
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            host: self.host.clone(),
            port_range: self.port_base..self.port_base.saturating_add(self.port_span),
        }
    }

    /// Deployment options derived from the flow-wide knobs.
    #[must_use]
    pub fn deploy_options(&self) -> DeployOptions {
        let mut aggregation = AggregationConfig::default();
        if let Some(ms) = self.aggregation.max_age_ms {
            aggregation.max_age = Duration::from_millis(ms);
        }
        if let Some(ms) = self.aggregation.completed_retention_ms {
            aggregation.completed_retention = Duration::from_millis(ms);
        }
        DeployOptions {
            profiling: self.profiling,
            flush_interval: self
                .flush_interval_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            aggregation,
            ..DeployOptions::default()
        }
    }
}

/// Default registry kind per declared stage kind.
fn stage_spec(stage: &StageConfig) -> Option<StageSpec> {
    let kind = match &stage.stage_kind {
        Some(kind) => kind.clone(),
        None => match stage.kind {
            NodeKind::Preprocessor => "preprocessor".to_string(),
            NodeKind::Encoder => "encoder".to_string(),
            NodeKind::Indexer => "indexer".to_string(),
            NodeKind::Router => "router".to_string(),
            NodeKind::Frontend => return None,
        },
    };
    let params = stage
        .params
        .as_ref()
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(serde_json::Value::Null);
    Some(StageSpec::with_params(kind, params))
}
