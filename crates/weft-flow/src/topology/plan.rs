//! The compiled, fully resolved form of a service graph.
//!
//! A [`CompiledFlow`] is a plain serializable value: every edge carries
//! its transport pattern, bind side, and concrete port, so the connecting
//! side needs no discovery service and the whole plan can be exported for
//! manifests or diagrams without re-running compilation.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use weft_core::envelope::PartInfo;
use weft_core::stage::StageSpec;
use weft_core::transport::TransportPattern;

use super::{IncomePolicy, NodeKind};

/// Which end of an edge binds its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindSide {
    /// The producer binds; consumers connect.
    Upstream,
    /// The consumer binds; producers connect.
    Downstream,
}

/// A resolved endpoint of one node side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum EndpointPlan {
    /// This side binds the port.
    Bind {
        /// Transport pattern of the attached edges.
        pattern: TransportPattern,
        /// Concrete port on the flow host.
        port: u16,
        /// Peer instances expected to connect.
        expected_peers: usize,
    },
    /// This side connects to already-bound peers.
    Connect {
        /// Transport pattern of the attached edges.
        pattern: TransportPattern,
        /// Bound ports of the peers, on the flow host.
        peers: Vec<u16>,
    },
}

/// Part-stack range assigned to a consumer on a multi-consumer broadcast
/// edge: instance `i` of the node stamps `first_part_id + i` of
/// `num_parts` on every envelope it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchParts {
    /// Part id of this node's first instance.
    pub first_part_id: u32,
    /// Total instances across all consumers of the broadcast.
    pub num_parts: u32,
}

impl BranchParts {
    /// The part level stamped by replica `instance` of this node.
    #[must_use]
    pub fn level_for(self, instance: u32) -> PartInfo {
        PartInfo {
            part_id: self.first_part_id + instance,
            num_parts: self.num_parts,
        }
    }
}

/// One fully resolved node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledNode {
    /// Stage name, unique in the flow.
    pub name: String,
    /// Declared stage kind.
    pub kind: NodeKind,
    /// Instance count.
    pub replicas: u32,
    /// Declared income preference.
    pub income: IncomePolicy,
    /// Stage construction spec; `None` for the frontend.
    pub stage: Option<StageSpec>,
    /// Whether the compiler inserted this node (relay stages).
    pub synthetic: bool,
    /// Resolved data-in side.
    pub data_in: Option<EndpointPlan>,
    /// Resolved data-out side.
    pub data_out: Option<EndpointPlan>,
    /// One control port per instance; empty for the frontend.
    pub control_ports: Vec<u16>,
    /// Broadcast sibling identity, when this node consumes a
    /// multi-consumer broadcast edge.
    pub branch: Option<BranchParts>,
}

/// One fully resolved edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledEdge {
    /// Producer stage name.
    pub start: String,
    /// Consumer stage name.
    pub end: String,
    /// Resolved transport pattern.
    pub pattern: TransportPattern,
    /// Which end binds.
    pub bind: BindSide,
    /// The bound port.
    pub port: u16,
}

/// The complete compiled flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFlow {
    /// Flow name.
    pub name: String,
    /// Host every endpoint lives on.
    pub host: String,
    /// Resolved nodes, in declaration order (synthetic relays appended).
    pub nodes: Vec<CompiledNode>,
    /// Resolved edges.
    pub edges: Vec<CompiledEdge>,
}

impl CompiledFlow {
    /// Looks up a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// The designated frontend node.
    #[must_use]
    pub fn frontend(&self) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Frontend)
    }

    /// Whether some node binds the given port (data or control side).
    #[must_use]
    pub fn port_is_bound(&self, port: u16) -> bool {
        self.nodes.iter().any(|n| {
            n.control_ports.contains(&port)
                || [&n.data_in, &n.data_out].into_iter().flatten().any(
                    |endpoint| matches!(endpoint, EndpointPlan::Bind { port: p, .. } if *p == port),
                )
        })
    }

    /// Builds a socket address on the flow host.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the configured host is not an address.
    pub fn host_addr(&self, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{port}", self.host).parse()
    }

    /// Serializes the plan as pretty JSON for manifests and diagrams.
    ///
    /// # Errors
    ///
    /// Returns the serialization error.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Reads a plan back from its JSON export.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
