//! Service graph and topology compiler.
//!
//! The compiler turns an abstract graph of named stages (with replica
//! counts and income preferences) into a [`CompiledFlow`]: for every edge
//! one of three transport patterns, exactly one bound endpoint, and a
//! concrete port. Multiplicity is resolved from the fan-out and fan-in of
//! the whole graph; an edge that leaves both questions open is rejected,
//! never guessed. Everything here fails before a single runtime starts.

use std::collections::VecDeque;
use std::ops::Range;

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use weft_core::stage::StageSpec;
use weft_core::transport::TransportPattern;

mod error;
mod plan;

#[cfg(test)]
mod tests;

pub use error::TopologyError;
pub use plan::{BindSide, BranchParts, CompiledEdge, CompiledFlow, CompiledNode, EndpointPlan};

/// The closed set of stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Normalizes raw input into documents.
    Preprocessor,
    /// Turns documents and queries into feature vectors.
    Encoder,
    /// Stores documents and answers queries.
    Indexer,
    /// Map or reduce router.
    Router,
    /// The externally reachable boundary of the flow.
    Frontend,
}

/// Declared delivery preference for a node's inbound side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomePolicy {
    /// Load-balanced pull: each envelope reaches one instance.
    #[default]
    Queue,
    /// Subscribe: every instance receives a full copy.
    Broadcast,
}

/// One declared stage of the abstract graph.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    /// Unique stage name.
    pub name: String,
    /// Stage kind.
    pub kind: NodeKind,
    /// Instance count, at least 1.
    pub replicas: u32,
    /// Inbound delivery preference.
    pub income: IncomePolicy,
    /// Stage construction spec; `None` for the frontend.
    pub stage: Option<StageSpec>,
    /// Declared downstream neighbor names.
    pub outgoing: Vec<String>,
    /// Declared upstream neighbor names.
    pub upstream: Vec<String>,
}

impl ServiceNode {
    /// Creates a stage with default multiplicity and no neighbors.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            replicas: 1,
            income: IncomePolicy::default(),
            stage: None,
            outgoing: Vec::new(),
            upstream: Vec::new(),
        }
    }
}

/// Compilation options.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Host every endpoint binds or connects on.
    pub host: String,
    /// Ports drawn for binding endpoints without an explicit port.
    pub port_range: Range<u16>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_range: 47_000..48_000,
        }
    }
}

/// The abstract service graph, before compilation.
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    name: String,
    nodes: Vec<ServiceNode>,
    index: FxHashMap<String, usize>,
}

impl ServiceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Flow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateNode`] when the name is taken.
    pub fn add_node(&mut self, node: ServiceNode) -> Result<(), TopologyError> {
        if self.index.contains_key(&node.name) {
            return Err(TopologyError::DuplicateNode(node.name));
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Declares an edge `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::MissingNode`] when either end is unknown,
    /// or [`TopologyError::SelfLoop`] when both ends are the same stage.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), TopologyError> {
        if from == to {
            return Err(TopologyError::SelfLoop(from.to_string()));
        }
        let from_idx = *self.index.get(from).ok_or_else(|| TopologyError::MissingNode {
            node: to.to_string(),
            reference: from.to_string(),
        })?;
        if !self.index.contains_key(to) {
            return Err(TopologyError::MissingNode {
                node: from.to_string(),
                reference: to.to_string(),
            });
        }
        let outgoing = &mut self.nodes[from_idx].outgoing;
        if !outgoing.iter().any(|n| n == to) {
            outgoing.push(to.to_string());
        }
        Ok(())
    }

    /// Returns a declared node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ServiceNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Compiles the graph into concrete transport bindings.
    ///
    /// # Errors
    ///
    /// Returns a [`TopologyError`] for any invalid or ambiguous graph;
    /// nothing is partially applied.
    pub fn compile(&self, options: &CompileOptions) -> Result<CompiledFlow, TopologyError> {
        let mut build = Build::from_graph(self)?;
        build.validate()?;
        build.insert_relays()?;
        build.reject_ambiguous()?;
        let resolved = build.resolve_edges();
        build.assemble(self.name.clone(), options, &resolved)
    }
}

// ---- Compiler internals ----

#[derive(Debug, Clone)]
struct BuildNode {
    name: String,
    kind: NodeKind,
    replicas: u32,
    income: IncomePolicy,
    stage: Option<StageSpec>,
    synthetic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    u: usize,
    v: usize,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedEdge {
    u: usize,
    v: usize,
    pattern: TransportPattern,
    bind: BindSide,
}

struct Build {
    nodes: Vec<BuildNode>,
    index: FxHashMap<String, usize>,
    edges: Vec<Edge>,
    frontend: usize,
}

impl Build {
    /// Resolves declared neighbor references into an edge list.
    fn from_graph(graph: &ServiceGraph) -> Result<Self, TopologyError> {
        if graph.nodes.is_empty() {
            return Err(TopologyError::EmptyGraph);
        }

        let mut frontend = None;
        for node in &graph.nodes {
            if node.replicas == 0 {
                return Err(TopologyError::ZeroReplicas(node.name.clone()));
            }
            if node.kind == NodeKind::Frontend {
                if node.replicas > 1 {
                    return Err(TopologyError::ReplicatedFrontend(node.name.clone()));
                }
                match frontend {
                    None => frontend = Some(node.name.clone()),
                    Some(ref first) => {
                        return Err(TopologyError::MultipleFrontends(
                            first.clone(),
                            node.name.clone(),
                        ));
                    }
                }
            }
        }
        let frontend_name = frontend.ok_or(TopologyError::MissingFrontend)?;

        let nodes: Vec<BuildNode> = graph
            .nodes
            .iter()
            .map(|n| BuildNode {
                name: n.name.clone(),
                kind: n.kind,
                replicas: n.replicas,
                income: n.income,
                stage: n.stage.clone(),
                synthetic: false,
            })
            .collect();
        let index: FxHashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let frontend = index[&frontend_name];

        // An edge may be declared on either side; both resolve to the
        // same (u, v) pair, deduplicated in declaration order.
        let mut edges: Vec<Edge> = Vec::new();
        let mut push_edge = |owner: &str, u_name: &str, v_name: &str| {
            if u_name == v_name {
                return Err(TopologyError::SelfLoop(owner.to_string()));
            }
            let u = *index.get(u_name).ok_or_else(|| TopologyError::MissingNode {
                node: owner.to_string(),
                reference: u_name.to_string(),
            })?;
            let v = *index.get(v_name).ok_or_else(|| TopologyError::MissingNode {
                node: owner.to_string(),
                reference: v_name.to_string(),
            })?;
            let edge = Edge { u, v };
            if !edges.contains(&edge) {
                edges.push(edge);
            }
            Ok(())
        };
        for node in &graph.nodes {
            for to in &node.outgoing {
                push_edge(&node.name, &node.name, to)?;
            }
            for from in &node.upstream {
                push_edge(&node.name, from, &node.name)?;
            }
        }

        Ok(Self {
            nodes,
            index,
            edges,
            frontend,
        })
    }

    fn fan_out(&self, i: usize) -> usize {
        self.edges.iter().filter(|e| e.u == i).count()
    }

    fn fan_in(&self, i: usize) -> usize {
        self.edges.iter().filter(|e| e.v == i).count()
    }

    fn consumers(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.iter().filter(move |e| e.u == i).map(|e| e.v)
    }

    fn producers(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.iter().filter(move |e| e.v == i).map(|e| e.u)
    }

    /// Structural validation: the data path must form a ring through the
    /// frontend and be acyclic everywhere else.
    fn validate(&self) -> Result<(), TopologyError> {
        for (i, node) in self.nodes.iter().enumerate() {
            if self.fan_in(i) == 0 || self.fan_out(i) == 0 {
                return Err(TopologyError::DisconnectedNode(node.name.clone()));
            }
        }
        self.check_acyclic_off_frontend()
    }

    /// Kahn's algorithm over the graph with the frontend removed; the
    /// frontend legitimately closes the request/response ring.
    fn check_acyclic_off_frontend(&self) -> Result<(), TopologyError> {
        let mut in_degree: FxHashMap<usize, usize> = FxHashMap::default();
        for i in 0..self.nodes.len() {
            if i != self.frontend {
                in_degree.insert(i, 0);
            }
        }
        for edge in &self.edges {
            if edge.u == self.frontend || edge.v == self.frontend {
                continue;
            }
            *in_degree.entry(edge.v).or_insert(0) += 1;
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(i) = queue.pop_front() {
            processed += 1;
            for edge in &self.edges {
                if edge.u != i || edge.v == self.frontend {
                    continue;
                }
                if let Some(d) = in_degree.get_mut(&edge.v) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(edge.v);
                    }
                }
            }
        }
        if processed < in_degree.len() {
            let ordered: FxHashSet<usize> = in_degree
                .iter()
                .filter(|(_, &d)| d == 0)
                .map(|(&i, _)| i)
                .collect();
            let stuck = in_degree
                .keys()
                .find(|i| !ordered.contains(i))
                .copied()
                .unwrap_or(0);
            return Err(TopologyError::CycleDetected(self.nodes[stuck].name.clone()));
        }
        Ok(())
    }

    /// Whether this node's outbound side must publish (broadcast).
    fn must_publish(&self, i: usize) -> bool {
        self.fan_out(i) > 1
            || self
                .consumers(i)
                .any(|c| self.nodes[c].income == IncomePolicy::Broadcast)
    }

    /// Whether this node's inbound side must bind a pull endpoint.
    fn must_funnel(&self, i: usize) -> bool {
        self.fan_in(i) > 1 && self.nodes[i].income == IncomePolicy::Queue
    }

    /// A replicated node never binds: every place where resolution would
    /// force one to, a synthetic relay (replicas = 1) takes over the bind.
    fn insert_relays(&mut self) -> Result<(), TopologyError> {
        let original = self.nodes.len();

        for i in 0..original {
            if self.nodes[i].replicas <= 1 {
                continue;
            }
            if self.must_funnel(i) {
                let relay = self.add_relay(format!("{}_intake", self.nodes[i].name))?;
                for edge in &mut self.edges {
                    if edge.v == i {
                        edge.v = relay;
                    }
                }
                self.edges.push(Edge { u: relay, v: i });
            }
            if self.must_publish(i) {
                let relay = self.add_relay(format!("{}_fanout", self.nodes[i].name))?;
                for edge in &mut self.edges {
                    if edge.u == i {
                        edge.u = relay;
                    }
                }
                self.edges.push(Edge { u: i, v: relay });
            }
        }

        // Replicated producer group feeding a replicated consumer group:
        // one relay funnels the producers in and distributes out.
        let pairs: Vec<Edge> = self
            .edges
            .iter()
            .copied()
            .filter(|e| self.nodes[e.u].replicas > 1 && self.nodes[e.v].replicas > 1)
            .collect();
        for edge in pairs {
            let relay = self.add_relay(format!(
                "{}_{}_relay",
                self.nodes[edge.u].name, self.nodes[edge.v].name
            ))?;
            self.edges.retain(|e| *e != edge);
            self.edges.push(Edge { u: edge.u, v: relay });
            self.edges.push(Edge { u: relay, v: edge.v });
        }
        Ok(())
    }

    fn add_relay(&mut self, name: String) -> Result<usize, TopologyError> {
        if self.index.contains_key(&name) {
            return Err(TopologyError::DuplicateNode(name));
        }
        debug!(relay = %name, "inserting synthetic relay stage");
        let idx = self.nodes.len();
        self.index.insert(name.clone(), idx);
        self.nodes.push(BuildNode {
            name,
            kind: NodeKind::Router,
            replicas: 1,
            income: IncomePolicy::Queue,
            stage: Some(StageSpec::new("passthrough")),
            synthetic: true,
        });
        Ok(idx)
    }

    /// The single most important invariant: no edge may leave both
    /// multiplicity questions unresolved.
    fn reject_ambiguous(&self) -> Result<(), TopologyError> {
        for edge in &self.edges {
            if self.must_publish(edge.u) && self.must_funnel(edge.v) {
                let competing_out = self
                    .consumers(edge.u)
                    .find(|&c| {
                        c != edge.v || self.nodes[c].income == IncomePolicy::Broadcast
                    })
                    .map_or_else(String::new, |c| self.nodes[c].name.clone());
                let competing_in = self
                    .producers(edge.v)
                    .find(|&p| p != edge.u)
                    .map_or_else(String::new, |p| self.nodes[p].name.clone());
                return Err(TopologyError::AmbiguousFanPattern {
                    start: self.nodes[edge.u].name.clone(),
                    end: self.nodes[edge.v].name.clone(),
                    competing_out,
                    competing_in,
                });
            }
        }
        Ok(())
    }

    /// Hop distance of every node to the frontend, over undirected edges.
    fn frontend_distance(&self) -> Vec<usize> {
        let mut dist = vec![usize::MAX; self.nodes.len()];
        dist[self.frontend] = 0;
        let mut queue = VecDeque::from([self.frontend]);
        while let Some(i) = queue.pop_front() {
            for edge in &self.edges {
                let next = if edge.u == i {
                    edge.v
                } else if edge.v == i {
                    edge.u
                } else {
                    continue;
                };
                if dist[next] == usize::MAX {
                    dist[next] = dist[i] + 1;
                    queue.push_back(next);
                }
            }
        }
        dist
    }

    /// Resolves the pattern and bind side of every edge.
    fn resolve_edges(&self) -> Vec<ResolvedEdge> {
        let dist = self.frontend_distance();
        self.edges
            .iter()
            .map(|&Edge { u, v }| {
                let (pattern, bind) = if self.must_publish(u) {
                    (TransportPattern::Broadcast, BindSide::Upstream)
                } else if self.must_funnel(v) {
                    (TransportPattern::LoadBalanced, BindSide::Downstream)
                } else if self.nodes[u].replicas > 1 {
                    // Producer group funnels into the single consumer.
                    (TransportPattern::LoadBalanced, BindSide::Downstream)
                } else if self.nodes[v].replicas > 1 {
                    // Single producer distributes across the consumer group.
                    (TransportPattern::LoadBalanced, BindSide::Upstream)
                } else {
                    // Exclusive pair: the side nearer the frontend binds,
                    // the upstream on a tie.
                    let bind = if dist[u] <= dist[v] {
                        BindSide::Upstream
                    } else {
                        BindSide::Downstream
                    };
                    (TransportPattern::Exclusive, bind)
                };
                ResolvedEdge { u, v, pattern, bind }
            })
            .collect()
    }

    /// Allocates ports, assigns broadcast branches, and produces the
    /// final plan.
    fn assemble(
        &self,
        name: String,
        options: &CompileOptions,
        resolved: &[ResolvedEdge],
    ) -> Result<CompiledFlow, TopologyError> {
        let n = self.nodes.len();
        let mut alloc = PortAllocator::new(options.port_range.clone());

        let mut out_port: Vec<Option<u16>> = vec![None; n];
        let mut in_port: Vec<Option<u16>> = vec![None; n];
        let mut control_ports: Vec<Vec<u16>> = vec![Vec::new(); n];
        for i in 0..n {
            if resolved.iter().any(|e| e.u == i && e.bind == BindSide::Upstream) {
                out_port[i] = Some(alloc.next()?);
            }
            if resolved.iter().any(|e| e.v == i && e.bind == BindSide::Downstream) {
                in_port[i] = Some(alloc.next()?);
            }
            if self.nodes[i].kind != NodeKind::Frontend {
                for _ in 0..self.nodes[i].replicas {
                    control_ports[i].push(alloc.next()?);
                }
            }
        }

        // Broadcast sibling identity: consecutive part-id ranges across
        // the instances of every consumer of one publisher, in edge order.
        let mut branch: Vec<Option<BranchParts>> = vec![None; n];
        for u in 0..n {
            let consumers: Vec<usize> = resolved
                .iter()
                .filter(|e| e.u == u && e.pattern == TransportPattern::Broadcast)
                .map(|e| e.v)
                .collect();
            let total: u32 = consumers.iter().map(|&v| self.nodes[v].replicas).sum();
            if total <= 1 {
                continue;
            }
            let mut next_part = 1u32;
            for &v in &consumers {
                if branch[v].is_none() {
                    branch[v] = Some(BranchParts {
                        first_part_id: next_part,
                        num_parts: total,
                    });
                }
                next_part += self.nodes[v].replicas;
            }
        }

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let data_out = if let Some(port) = out_port[i] {
                let pattern = resolved
                    .iter()
                    .find(|e| e.u == i)
                    .map(|e| e.pattern)
                    .ok_or(TopologyError::Internal("bound out side without edges"))?;
                let expected_peers: usize = resolved
                    .iter()
                    .filter(|e| e.u == i)
                    .map(|e| self.nodes[e.v].replicas as usize)
                    .sum();
                Some(EndpointPlan::Bind {
                    pattern,
                    port,
                    expected_peers,
                })
            } else if let Some(edge) = resolved.iter().find(|e| e.u == i) {
                let peer = in_port[edge.v]
                    .ok_or(TopologyError::Internal("connect out side without peer port"))?;
                Some(EndpointPlan::Connect {
                    pattern: edge.pattern,
                    peers: vec![peer],
                })
            } else {
                None
            };

            let data_in = if let Some(port) = in_port[i] {
                let pattern = resolved
                    .iter()
                    .find(|e| e.v == i)
                    .map(|e| e.pattern)
                    .ok_or(TopologyError::Internal("bound in side without edges"))?;
                let expected_peers: usize = resolved
                    .iter()
                    .filter(|e| e.v == i)
                    .map(|e| self.nodes[e.u].replicas as usize)
                    .sum();
                Some(EndpointPlan::Bind {
                    pattern,
                    port,
                    expected_peers,
                })
            } else {
                let in_edges: Vec<&ResolvedEdge> =
                    resolved.iter().filter(|e| e.v == i).collect();
                if in_edges.is_empty() {
                    None
                } else {
                    let mut peers = Vec::with_capacity(in_edges.len());
                    for edge in &in_edges {
                        peers.push(out_port[edge.u].ok_or(TopologyError::Internal(
                            "connect in side without peer port",
                        ))?);
                    }
                    Some(EndpointPlan::Connect {
                        pattern: in_edges[0].pattern,
                        peers,
                    })
                }
            };

            let node = &self.nodes[i];
            nodes.push(CompiledNode {
                name: node.name.clone(),
                kind: node.kind,
                replicas: node.replicas,
                income: node.income,
                stage: node.stage.clone(),
                synthetic: node.synthetic,
                data_in,
                data_out,
                control_ports: control_ports[i].clone(),
                branch: branch[i],
            });
        }

        let edges = resolved
            .iter()
            .map(|e| {
                let port = match e.bind {
                    BindSide::Upstream => out_port[e.u],
                    BindSide::Downstream => in_port[e.v],
                };
                port.map(|port| CompiledEdge {
                    start: self.nodes[e.u].name.clone(),
                    end: self.nodes[e.v].name.clone(),
                    pattern: e.pattern,
                    bind: e.bind,
                    port,
                })
                .ok_or(TopologyError::Internal("edge without a bound port"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Bind uniqueness: every bound data port and control port is
        // distinct. The sequential allocator guarantees it; a violation
        // here is a compiler bug surfaced loudly.
        let mut seen = FxHashSet::default();
        for port in out_port
            .iter()
            .chain(in_port.iter())
            .filter_map(|p| *p)
            .chain(control_ports.iter().flatten().copied())
        {
            if !seen.insert(port) {
                return Err(TopologyError::DuplicateBind(port));
            }
        }

        Ok(CompiledFlow {
            name,
            host: options.host.clone(),
            nodes,
            edges,
        })
    }
}

struct PortAllocator {
    next: u16,
    range: Range<u16>,
}

impl PortAllocator {
    fn new(range: Range<u16>) -> Self {
        Self {
            next: range.start,
            range,
        }
    }

    fn next(&mut self) -> Result<u16, TopologyError> {
        if self.next >= self.range.end {
            return Err(TopologyError::PortRangeExhausted {
                start: self.range.start,
                end: self.range.end,
            });
        }
        let port = self.next;
        self.next += 1;
        Ok(port)
    }
}
