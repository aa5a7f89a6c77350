//! Unit tests for graph validation, pattern resolution, relay insertion,
//! port allocation, and plan export.

use fxhash::FxHashSet;

use weft_core::transport::TransportPattern;

use super::*;
use crate::builder::FlowBuilder;

fn ring(names: &[(&str, NodeKind)], edges: &[(&str, &str)]) -> ServiceGraph {
    let mut graph = ServiceGraph::new("test");
    for (name, kind) in names {
        graph.add_node(ServiceNode::new(*name, *kind)).unwrap();
    }
    for (from, to) in edges {
        graph.connect(from, to).unwrap();
    }
    graph
}

/// The concrete reference flow: prep -> encoder -> [vec_idx, doc_idx]
/// -> reduce -> frontend, closed through the frontend.
fn scenario_graph() -> ServiceGraph {
    FlowBuilder::new("scenario")
        .frontend("frontend")
        .preprocessor("prep")
        .encoder("encoder")
        .indexer_with("vec_idx", serde_json::json!({"mode": "vector", "label": "vec_idx"}))
        .indexer_with("doc_idx", serde_json::json!({"mode": "content", "label": "doc_idx"}))
        .router_with("reduce", serde_json::json!({"mode": "reduce", "merge": "score_sum"}))
        .connect("frontend", "prep")
        .connect("prep", "encoder")
        .connect("encoder", "vec_idx")
        .connect("encoder", "doc_idx")
        .connect("vec_idx", "reduce")
        .connect("doc_idx", "reduce")
        .connect("reduce", "frontend")
        .build()
        .unwrap()
}

fn edge<'a>(flow: &'a CompiledFlow, start: &str, end: &str) -> &'a CompiledEdge {
    flow.edges
        .iter()
        .find(|e| e.start == start && e.end == end)
        .unwrap_or_else(|| panic!("edge {start} -> {end} missing"))
}

// ---- Validation errors ----

#[test]
fn test_empty_graph_rejected() {
    let graph = ServiceGraph::new("empty");
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::EmptyGraph)
    ));
}

#[test]
fn test_missing_neighbor_rejected() {
    let mut graph = ServiceGraph::new("test");
    graph
        .add_node(ServiceNode::new("frontend", NodeKind::Frontend))
        .unwrap();
    let mut node = ServiceNode::new("prep", NodeKind::Preprocessor);
    node.outgoing.push("ghost".to_string());
    graph.add_node(node).unwrap();
    let err = graph.compile(&CompileOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        TopologyError::MissingNode { ref node, ref reference }
            if node == "prep" && reference == "ghost"
    ));
}

#[test]
fn test_self_loop_rejected() {
    let mut graph = ServiceGraph::new("test");
    graph
        .add_node(ServiceNode::new("prep", NodeKind::Preprocessor))
        .unwrap();
    assert!(matches!(
        graph.connect("prep", "prep"),
        Err(TopologyError::SelfLoop(_))
    ));

    // Declared on the node itself, caught at compile time.
    let mut graph = ServiceGraph::new("test");
    graph
        .add_node(ServiceNode::new("frontend", NodeKind::Frontend))
        .unwrap();
    let mut node = ServiceNode::new("prep", NodeKind::Preprocessor);
    node.upstream.push("prep".to_string());
    graph.add_node(node).unwrap();
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::SelfLoop(_))
    ));
}

#[test]
fn test_missing_frontend_rejected() {
    let graph = ring(
        &[("a", NodeKind::Preprocessor), ("b", NodeKind::Encoder)],
        &[("a", "b"), ("b", "a")],
    );
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::MissingFrontend)
    ));
}

#[test]
fn test_cycle_off_frontend_rejected() {
    let graph = ring(
        &[
            ("frontend", NodeKind::Frontend),
            ("a", NodeKind::Encoder),
            ("b", NodeKind::Indexer),
        ],
        &[
            ("frontend", "a"),
            ("a", "b"),
            ("b", "a"), // cycle avoiding the frontend
            ("b", "frontend"),
        ],
    );
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::CycleDetected(_))
    ));
}

#[test]
fn test_disconnected_node_rejected() {
    let mut graph = scenario_graph();
    graph
        .add_node(ServiceNode::new("orphan", NodeKind::Indexer))
        .unwrap();
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::DisconnectedNode(name)) if name == "orphan"
    ));
}

// ---- Compiler soundness: many-to-many is never silently resolved ----

#[test]
fn test_many_to_many_edge_rejected() {
    // a fans out to {x, y}; y also funnels from b: the edge a -> y leaves
    // both multiplicity questions open.
    let graph = ring(
        &[
            ("frontend", NodeKind::Frontend),
            ("a", NodeKind::Encoder),
            ("b", NodeKind::Encoder),
            ("x", NodeKind::Indexer),
            ("y", NodeKind::Indexer),
        ],
        &[
            ("frontend", "a"),
            ("frontend", "b"),
            ("a", "x"),
            ("a", "y"),
            ("b", "y"),
            ("x", "frontend"),
            ("y", "frontend"),
        ],
    );
    let err = graph.compile(&CompileOptions::default()).unwrap_err();
    match err {
        TopologyError::AmbiguousFanPattern {
            start,
            end,
            competing_out,
            competing_in,
        } => {
            assert_eq!(start, "a");
            assert_eq!(end, "y");
            assert_eq!(competing_out, "x");
            assert_eq!(competing_in, "b");
        }
        other => panic!("expected ambiguous fan pattern, got {other}"),
    }
}

#[test]
fn test_explicit_router_resolves_many_to_many() {
    // The same shape with a router splitting the a -> y edge compiles:
    // a broadcasts to {x, relay}; y funnels {relay, b}.
    let graph = FlowBuilder::new("fixed")
        .frontend("frontend")
        .encoder("a")
        .encoder("b")
        .router_with("relay", serde_json::json!({"mode": "map", "parts": 1}))
        .indexer_with("x", serde_json::Value::Null)
        .indexer_with("y", serde_json::Value::Null)
        .connect("frontend", "a")
        .connect("frontend", "b")
        .connect("a", "x")
        .connect("a", "relay")
        .connect("relay", "y")
        .connect("b", "y")
        .connect("x", "frontend")
        .connect("y", "frontend")
        .build()
        .unwrap();
    let flow = graph.compile(&CompileOptions::default()).unwrap();
    assert_eq!(
        edge(&flow, "a", "relay").pattern,
        TransportPattern::Broadcast
    );
    assert_eq!(
        edge(&flow, "relay", "y").pattern,
        TransportPattern::LoadBalanced
    );
}

// ---- Compiler completeness ----

#[test]
fn test_every_edge_gets_exactly_one_pattern_and_bind() {
    let flow = scenario_graph().compile(&CompileOptions::default()).unwrap();
    assert_eq!(flow.edges.len(), 7);
    for e in &flow.edges {
        // Every edge carries a resolved pattern, one bind side, one port.
        assert!(flow.port_is_bound(e.port), "port {} unbound", e.port);
    }
}

#[test]
fn test_scenario_patterns() {
    let flow = scenario_graph().compile(&CompileOptions::default()).unwrap();

    // Frontend pair edges: the frontend (distance 0) binds both.
    let entry = edge(&flow, "frontend", "prep");
    assert_eq!(entry.pattern, TransportPattern::Exclusive);
    assert_eq!(entry.bind, BindSide::Upstream);
    let exit = edge(&flow, "reduce", "frontend");
    assert_eq!(exit.pattern, TransportPattern::Exclusive);
    assert_eq!(exit.bind, BindSide::Downstream);

    // Encoder's single logical output fans to two distinct targets.
    let to_vec = edge(&flow, "encoder", "vec_idx");
    let to_doc = edge(&flow, "encoder", "doc_idx");
    assert_eq!(to_vec.pattern, TransportPattern::Broadcast);
    assert_eq!(to_doc.pattern, TransportPattern::Broadcast);
    assert_eq!(to_vec.bind, BindSide::Upstream);
    // One publish endpoint shared by both broadcast edges.
    assert_eq!(to_vec.port, to_doc.port);

    // The reduce funnel: the single consumer binds the pull endpoint.
    let from_vec = edge(&flow, "vec_idx", "reduce");
    let from_doc = edge(&flow, "doc_idx", "reduce");
    assert_eq!(from_vec.pattern, TransportPattern::LoadBalanced);
    assert_eq!(from_vec.bind, BindSide::Downstream);
    assert_eq!(from_vec.port, from_doc.port);
}

#[test]
fn test_broadcast_consumers_get_branch_parts() {
    let flow = scenario_graph().compile(&CompileOptions::default()).unwrap();
    let vec_branch = flow.node("vec_idx").unwrap().branch.unwrap();
    let doc_branch = flow.node("doc_idx").unwrap().branch.unwrap();
    assert_eq!(vec_branch.num_parts, 2);
    assert_eq!(doc_branch.num_parts, 2);
    let mut ids = [vec_branch.first_part_id, doc_branch.first_part_id];
    ids.sort_unstable();
    assert_eq!(ids, [1, 2]);
    // Pair consumers carry no branch.
    assert!(flow.node("prep").unwrap().branch.is_none());
}

// ---- Bind uniqueness ----

#[test]
fn test_no_two_binds_share_a_port() {
    let flow = scenario_graph().compile(&CompileOptions::default()).unwrap();
    let mut seen = FxHashSet::default();
    for node in &flow.nodes {
        for endpoint in [&node.data_in, &node.data_out].into_iter().flatten() {
            if let EndpointPlan::Bind { port, .. } = endpoint {
                assert!(seen.insert(*port), "duplicate bind port {port}");
            }
        }
        for port in &node.control_ports {
            assert!(seen.insert(*port), "duplicate control port {port}");
        }
    }
}

#[test]
fn test_port_range_exhaustion_reported() {
    let options = CompileOptions {
        host: "127.0.0.1".to_string(),
        port_range: 47_000..47_003,
    };
    assert!(matches!(
        scenario_graph().compile(&options),
        Err(TopologyError::PortRangeExhausted { .. })
    ));
}

// ---- Replica handling ----

#[test]
fn test_replicated_consumer_connects_and_producer_binds() {
    let graph = FlowBuilder::new("replicas")
        .frontend("frontend")
        .preprocessor("prep")
        .encoder("enc")
        .connect("frontend", "prep")
        .connect("prep", "enc")
        .connect("enc", "frontend")
        .replicas("enc", 3)
        .build()
        .unwrap();
    let flow = graph.compile(&CompileOptions::default()).unwrap();

    // prep -> enc: the single producer binds and distributes.
    let distribute = edge(&flow, "prep", "enc");
    assert_eq!(distribute.pattern, TransportPattern::LoadBalanced);
    assert_eq!(distribute.bind, BindSide::Upstream);

    // enc -> frontend: the replica group funnels into the single consumer.
    let funnel = edge(&flow, "enc", "frontend");
    assert_eq!(funnel.pattern, TransportPattern::LoadBalanced);
    assert_eq!(funnel.bind, BindSide::Downstream);

    // The replicated node never binds.
    let enc = flow.node("enc").unwrap();
    assert!(matches!(enc.data_in, Some(EndpointPlan::Connect { .. })));
    assert!(matches!(enc.data_out, Some(EndpointPlan::Connect { .. })));
    assert_eq!(enc.control_ports.len(), 3);
}

#[test]
fn test_replica_groups_back_to_back_get_a_relay() {
    let graph = FlowBuilder::new("groups")
        .frontend("frontend")
        .preprocessor("prep")
        .encoder("enc")
        .connect("frontend", "prep")
        .connect("prep", "enc")
        .connect("enc", "frontend")
        .replicas("prep", 2)
        .replicas("enc", 2)
        .build()
        .unwrap();
    let flow = graph.compile(&CompileOptions::default()).unwrap();

    let relay = flow
        .node("prep_enc_relay")
        .expect("synthetic relay inserted");
    assert!(relay.synthetic);
    assert_eq!(relay.replicas, 1);
    // Funnel in from the producer group, distribute out to the consumers.
    assert!(matches!(
        relay.data_in,
        Some(EndpointPlan::Bind {
            pattern: TransportPattern::LoadBalanced,
            ..
        })
    ));
    assert!(matches!(
        relay.data_out,
        Some(EndpointPlan::Bind {
            pattern: TransportPattern::LoadBalanced,
            ..
        })
    ));
    assert!(edge(&flow, "prep", "prep_enc_relay").port > 0);
    assert!(edge(&flow, "prep_enc_relay", "enc").port > 0);
}

#[test]
fn test_broadcast_income_replicas_subscribe() {
    let graph = FlowBuilder::new("shards")
        .frontend("frontend")
        .preprocessor("prep")
        .indexer_with("shard", serde_json::Value::Null)
        .router_with("reduce", serde_json::json!({"mode": "reduce", "merge": "score_sum"}))
        .connect("frontend", "prep")
        .connect("prep", "shard")
        .connect("shard", "reduce")
        .connect("reduce", "frontend")
        .replicas("shard", 3)
        .income("shard", IncomePolicy::Broadcast)
        .build()
        .unwrap();
    let flow = graph.compile(&CompileOptions::default()).unwrap();

    // Every shard instance receives a full copy.
    let bcast = edge(&flow, "prep", "shard");
    assert_eq!(bcast.pattern, TransportPattern::Broadcast);
    assert_eq!(bcast.bind, BindSide::Upstream);

    // Each instance is its own sibling for the downstream reduce.
    let branch = flow.node("shard").unwrap().branch.unwrap();
    assert_eq!(branch.num_parts, 3);
    assert_eq!(branch.first_part_id, 1);
    assert_eq!(branch.level_for(2).part_id, 3);
}

#[test]
fn test_zero_replicas_rejected() {
    let graph = FlowBuilder::new("bad")
        .frontend("frontend")
        .preprocessor("prep")
        .connect("frontend", "prep")
        .connect("prep", "frontend")
        .replicas("prep", 0)
        .build()
        .unwrap();
    assert!(matches!(
        graph.compile(&CompileOptions::default()),
        Err(TopologyError::ZeroReplicas(_))
    ));
}

// ---- Plan export ----

#[test]
fn test_plan_round_trips_through_json() {
    let flow = scenario_graph().compile(&CompileOptions::default()).unwrap();
    let json = flow.to_json().unwrap();
    let back = CompiledFlow::from_json(&json).unwrap();
    assert_eq!(back.name, flow.name);
    assert_eq!(back.nodes.len(), flow.nodes.len());
    assert_eq!(back.edges.len(), flow.edges.len());
    let reduce = back.node("reduce").unwrap();
    assert_eq!(reduce.stage.as_ref().unwrap().kind, "router");
}
