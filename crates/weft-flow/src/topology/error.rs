//! Error types for topology compilation.

/// Errors raised while validating or compiling a service graph.
///
/// All of these surface before any runtime is started: a flow either
/// compiles completely or not at all.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The graph has no nodes.
    #[error("empty graph: no stages declared")]
    EmptyGraph,

    /// A node with the same name already exists.
    #[error("duplicate stage name: {0}")]
    DuplicateNode(String),

    /// A declared neighbor does not exist.
    #[error("stage '{node}' references unknown neighbor '{reference}'")]
    MissingNode {
        /// The node carrying the dangling reference.
        node: String,
        /// The name that resolves to nothing.
        reference: String,
    },

    /// A node lists itself as a neighbor.
    #[error("stage '{0}' declares itself as its own neighbor")]
    SelfLoop(String),

    /// No frontend stage was declared.
    #[error("no frontend stage declared")]
    MissingFrontend,

    /// More than one frontend stage was declared.
    #[error("multiple frontend stages: '{0}' and '{1}'")]
    MultipleFrontends(String, String),

    /// The frontend cannot be replicated.
    #[error("frontend stage '{0}' cannot have replicas")]
    ReplicatedFrontend(String),

    /// A replica count of zero is meaningless.
    #[error("stage '{0}' declares zero replicas")]
    ZeroReplicas(String),

    /// The graph contains a cycle that does not pass through the frontend.
    #[error("cycle detected involving stage: {0}")]
    CycleDetected(String),

    /// A stage is missing an input or output connection.
    #[error("disconnected stage: '{0}' needs both an upstream and a downstream")]
    DisconnectedNode(String),

    /// A many-to-many edge that the compiler refuses to resolve.
    #[error(
        "ambiguous fan pattern on edge {start} -> {end}: competes with edges \
         {start} -> {competing_out} and {competing_in} -> {end}; insert an \
         explicit router stage to split the many-to-many edge"
    )]
    AmbiguousFanPattern {
        /// Upstream end of the offending edge.
        start: String,
        /// Downstream end of the offending edge.
        end: String,
        /// The sibling edge that forces the upstream to publish.
        competing_out: String,
        /// The sibling edge that forces the downstream to funnel.
        competing_in: String,
    },

    /// The port allocator ran out of its configured range.
    #[error("port range {start}..{end} exhausted")]
    PortRangeExhausted {
        /// First port of the range.
        start: u16,
        /// One past the last port of the range.
        end: u16,
    },

    /// Two endpoints resolved to the same bind port.
    #[error("duplicate bind port: {0}")]
    DuplicateBind(u16),

    /// A compiler invariant did not hold.
    #[error("internal compiler invariant violated: {0}")]
    Internal(&'static str),
}
