//! Fluent construction of service graphs.
//!
//! ```rust,ignore
//! let graph = FlowBuilder::new("search")
//!     .frontend("frontend")
//!     .preprocessor("prep")
//!     .encoder("encoder")
//!     .indexer_with("vec_idx", serde_json::json!({"mode": "vector", "label": "vec_idx"}))
//!     .indexer_with("doc_idx", serde_json::json!({"mode": "content", "label": "doc_idx"}))
//!     .router_with("reduce", serde_json::json!({"mode": "reduce", "merge": "score_sum"}))
//!     .connect("frontend", "prep")
//!     .connect("prep", "encoder")
//!     .connect("encoder", "vec_idx")
//!     .connect("encoder", "doc_idx")
//!     .connect("vec_idx", "reduce")
//!     .connect("doc_idx", "reduce")
//!     .connect("reduce", "frontend")
//!     .build()?;
//! ```

use weft_core::stage::StageSpec;

use crate::topology::{IncomePolicy, NodeKind, ServiceGraph, ServiceNode, TopologyError};

/// Fluent builder for a [`ServiceGraph`].
///
/// Node and edge declarations are collected eagerly; name validation
/// happens at [`build`](Self::build) so declaration order is free.
pub struct FlowBuilder {
    name: String,
    nodes: Vec<ServiceNode>,
    edges: Vec<(String, String)>,
    errors: Vec<TopologyError>,
}

impl FlowBuilder {
    /// Starts a flow with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn push(mut self, node: ServiceNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Declares the frontend stage.
    #[must_use]
    pub fn frontend(self, name: &str) -> Self {
        self.push(ServiceNode::new(name, NodeKind::Frontend))
    }

    /// Declares a preprocessor backed by the builtin text preprocessor.
    #[must_use]
    pub fn preprocessor(self, name: &str) -> Self {
        let mut node = ServiceNode::new(name, NodeKind::Preprocessor);
        node.stage = Some(StageSpec::new("preprocessor"));
        self.push(node)
    }

    /// Declares an encoder backed by the builtin hash encoder.
    #[must_use]
    pub fn encoder(self, name: &str) -> Self {
        let mut node = ServiceNode::new(name, NodeKind::Encoder);
        node.stage = Some(StageSpec::new("encoder"));
        self.push(node)
    }

    /// Declares an indexer with kind-specific parameters.
    #[must_use]
    pub fn indexer_with(self, name: &str, params: serde_json::Value) -> Self {
        let mut node = ServiceNode::new(name, NodeKind::Indexer);
        node.stage = Some(StageSpec::with_params("indexer", params));
        self.push(node)
    }

    /// Declares a map or reduce router with parameters.
    #[must_use]
    pub fn router_with(self, name: &str, params: serde_json::Value) -> Self {
        let mut node = ServiceNode::new(name, NodeKind::Router);
        node.stage = Some(StageSpec::with_params("router", params));
        self.push(node)
    }

    /// Declares a stage with an explicit kind and spec.
    #[must_use]
    pub fn stage(self, name: &str, kind: NodeKind, spec: StageSpec) -> Self {
        let mut node = ServiceNode::new(name, kind);
        node.stage = Some(spec);
        self.push(node)
    }

    /// Sets the replica count of an already-declared stage.
    #[must_use]
    pub fn replicas(mut self, name: &str, replicas: u32) -> Self {
        match self.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => node.replicas = replicas,
            None => self.errors.push(TopologyError::MissingNode {
                node: self.name.clone(),
                reference: name.to_string(),
            }),
        }
        self
    }

    /// Sets the income preference of an already-declared stage.
    #[must_use]
    pub fn income(mut self, name: &str, income: IncomePolicy) -> Self {
        match self.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => node.income = income,
            None => self.errors.push(TopologyError::MissingNode {
                node: self.name.clone(),
                reference: name.to_string(),
            }),
        }
        self
    }

    /// Declares an edge.
    #[must_use]
    pub fn connect(mut self, from: &str, to: &str) -> Self {
        self.edges.push((from.to_string(), to.to_string()));
        self
    }

    /// Assembles the graph, reporting the first declaration error.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateNode`] or
    /// [`TopologyError::MissingNode`] for bad declarations; structural
    /// validation happens later, at compile time.
    pub fn build(self) -> Result<ServiceGraph, TopologyError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        let mut graph = ServiceGraph::new(self.name);
        for node in self.nodes {
            graph.add_node(node)?;
        }
        for (from, to) in self.edges {
            graph.connect(&from, &to)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assembles_graph() {
        let graph = FlowBuilder::new("flow")
            .frontend("frontend")
            .preprocessor("prep")
            .connect("frontend", "prep")
            .connect("prep", "frontend")
            .build()
            .unwrap();
        assert_eq!(graph.name(), "flow");
        assert!(graph.node("prep").is_some());
        assert_eq!(graph.node("prep").unwrap().outgoing, ["frontend"]);
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        let err = FlowBuilder::new("flow")
            .frontend("a")
            .preprocessor("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateNode(_)));
    }

    #[test]
    fn test_builder_reports_unknown_replica_target() {
        let err = FlowBuilder::new("flow")
            .frontend("a")
            .replicas("ghost", 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::MissingNode { .. }));
    }
}
