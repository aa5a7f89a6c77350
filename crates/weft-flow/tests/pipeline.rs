//! End-to-end pipeline tests over real loopback sockets.
//!
//! The reference flow under test:
//!
//! ```text
//! frontend -> prep -> encoder -> [vec_idx, doc_idx] -> reduce -> frontend
//! ```
//!
//! The encoder's single logical output fans to two distinct indexers
//! (broadcast); the reduce router funnels both partials back into one
//! envelope per request.

use std::time::Duration;

use tokio_stream::StreamExt;

use weft_core::envelope::{Document, Payload, SearchQuery};
use weft_flow::supervisor::default_registry;
use weft_flow::{CompileOptions, FlowBuilder, FrontendClient, ServiceGraph, Supervisor};
use weft_flow::supervisor::DeployOptions;

fn scenario_graph() -> ServiceGraph {
    FlowBuilder::new("scenario")
        .frontend("frontend")
        .preprocessor("prep")
        .encoder("encoder")
        .indexer_with(
            "vec_idx",
            serde_json::json!({"mode": "vector", "label": "vec_idx"}),
        )
        .indexer_with(
            "doc_idx",
            serde_json::json!({"mode": "content", "label": "doc_idx"}),
        )
        .router_with(
            "reduce",
            serde_json::json!({"mode": "reduce", "merge": "score_sum"}),
        )
        .connect("frontend", "prep")
        .connect("prep", "encoder")
        .connect("encoder", "vec_idx")
        .connect("encoder", "doc_idx")
        .connect("vec_idx", "reduce")
        .connect("doc_idx", "reduce")
        .connect("reduce", "frontend")
        .build()
        .expect("graph builds")
}

fn documents() -> Vec<Document> {
    vec![
        Document {
            doc_id: 1,
            content: "the quick brown fox".to_string(),
            embedding: None,
        },
        Document {
            doc_id: 2,
            content: "jumps over the lazy dog".to_string(),
            embedding: None,
        },
        Document {
            doc_id: 3,
            content: "a fox among the reeds".to_string(),
            embedding: None,
        },
    ]
}

/// Deploys the scenario on its own port range and runs `body` against a
/// connected client.
async fn with_scenario<F, Fut>(port_base: u16, body: F)
where
    F: FnOnce(FrontendClient) -> Fut,
    Fut: std::future::Future<Output = FrontendClient>,
{
    let options = CompileOptions {
        host: "127.0.0.1".to_string(),
        port_range: port_base..port_base + 64,
    };
    let flow = scenario_graph().compile(&options).expect("compiles");

    let deploy = DeployOptions::default();
    let registry = default_registry(&deploy.aggregation);
    let supervisor = Supervisor::new(&registry, deploy.clone());
    let handle = supervisor.deploy(&flow).await.expect("deploys");

    let client = FrontendClient::connect(&flow, &deploy.transport)
        .await
        .expect("client connects");
    let client = body(client).await;

    drop(client);
    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_index_request_reaches_both_indexers_and_merges_once() {
    with_scenario(47_400, |client| async move {
        let reply = tokio::time::timeout(
            Duration::from_secs(30),
            client.call_envelope(weft_core::envelope::Envelope::request(
                "it",
                Payload::Documents(documents()),
            )),
        )
        .await
        .expect("no response within 30s")
        .expect("call succeeds");

        // Exactly one combined envelope, only after both indexers acked.
        let Payload::Ack(ack) = &reply.payload else {
            panic!("expected merged ack, got {:?}", reply.payload)
        };
        let mut stages = ack.stages.clone();
        stages.sort();
        assert_eq!(stages, ["doc_idx", "vec_idx"]);
        assert_eq!(ack.accepted, 6); // three documents acked by each shard

        // Route: prep, encoder, one-of-the-indexers, reduce. The sibling
        // indexer's hop is equivalent provenance, merged away.
        let hops: Vec<&str> = reply.route.iter().map(|h| h.stage.as_str()).collect();
        assert_eq!(hops.len(), 4, "route was {hops:?}");
        assert_eq!(hops[0], "prep");
        assert_eq!(hops[1], "encoder");
        assert!(hops[2] == "vec_idx" || hops[2] == "doc_idx", "route was {hops:?}");
        assert_eq!(hops[3], "reduce");

        // The part stack is balanced again after the reduce.
        assert!(reply.current_parts().is_none());
        client
    })
    .await;
}

#[tokio::test]
async fn test_query_merges_scores_across_shards() {
    with_scenario(47_500, |client| async move {
        let _ = client
            .call(Payload::Documents(documents()))
            .await
            .expect("index succeeds");

        let reply = client
            .call(Payload::Query(SearchQuery {
                text: "quick fox".to_string(),
                top_k: 5,
                embedding: None,
            }))
            .await
            .expect("query succeeds");

        let Payload::Results(results) = reply else {
            panic!("expected results, got {reply:?}")
        };
        assert!(!results.is_empty());
        // Document 1 matches both query terms; it must rank first, with
        // content filled from the content shard and a score carrying
        // contributions from both shards.
        assert_eq!(results[0].doc_id, 1);
        assert_eq!(results[0].content.as_deref(), Some("the quick brown fox"));
        assert!(results[0].score > 0.0);
        assert!(results[0].trace.len() >= 2, "trace was {:?}", results[0].trace);
        client
    })
    .await;
}

#[tokio::test]
async fn test_streaming_call_yields_all_responses() {
    with_scenario(47_600, |client| async move {
        let _ = client
            .call(Payload::Documents(documents()))
            .await
            .expect("index succeeds");

        let queries = vec![
            Payload::Query(SearchQuery {
                text: "fox".to_string(),
                top_k: 3,
                embedding: None,
            }),
            Payload::Query(SearchQuery {
                text: "lazy dog".to_string(),
                top_k: 3,
                embedding: None,
            }),
            Payload::Query(SearchQuery {
                text: "reeds".to_string(),
                top_k: 3,
                embedding: None,
            }),
        ];
        let stream = client.stream(queries).await.expect("stream starts");
        let replies: Vec<_> = tokio::time::timeout(Duration::from_secs(30), stream.collect())
            .await
            .expect("stream completes in time");

        assert_eq!(replies.len(), 3);
        for reply in &replies {
            assert!(matches!(reply.payload, Payload::Results(_)));
        }
        client
    })
    .await;
}
