mod common;

use std::collections::HashSet;

use pretty_assertions::assert_eq;
use secretrag::records::encode_chunk;
use secretrag::shares::{encrypt_bytes, encrypt_vector};
use secretrag::{Embedder, HashingEmbedder, Identifier, QueryOptions};

use common::{config_for, coordinator, corpus, spawn_nodes, DIMS};

const QUERY: &str = "Tell me about places in Asia";

fn plaintext_top(k: usize) -> Vec<(String, f64)> {
    let embedder = HashingEmbedder::new(DIMS);
    let query = embedder.embed(QUERY).unwrap();
    let mut scored: Vec<(String, f64)> = corpus()
        .into_iter()
        .map(|text| {
            let doc = embedder.embed(&text).unwrap();
            let distance = doc
                .iter()
                .zip(&query)
                .map(|(d, q)| {
                    let diff = f64::from(*d) - f64::from(*q);
                    diff * diff
                })
                .sum::<f64>()
                .sqrt();
            (text, distance)
        })
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored.truncate(k);
    scored
}

#[tokio::test]
async fn secret_shared_query_matches_plaintext_baseline() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());

    let ids = coordinator.initialize().await.unwrap();
    let summary = coordinator.upload_chunks(&corpus(), 0).await.unwrap();
    assert_eq!(summary.document_ids.len(), 20);
    assert_eq!(summary.batches, 1);

    let results = coordinator.top_chunks(QUERY).await.unwrap();
    let baseline = plaintext_top(2);
    assert_eq!(results.len(), 2);
    for (result, (text, distance)) in results.iter().zip(&baseline) {
        assert_eq!(&result.chunk, text);
        assert!(
            (result.distance - distance).abs() < 1e-5,
            "distance {} vs plaintext {}",
            result.distance,
            distance
        );
    }
    let texts = corpus();
    let returned: HashSet<&str> = results.iter().map(|r| r.chunk.as_str()).collect();
    let seeded: HashSet<&str> = texts[..2].iter().map(String::as_str).collect();
    assert_eq!(returned, seeded);

    for node in &nodes {
        let stored = node.records(&ids.schema_id);
        assert_eq!(stored.len(), 20);
        for (record, text) in stored.iter().zip(&texts) {
            assert_ne!(record["chunk"].as_str().unwrap(), encode_chunk(text.as_bytes()));
        }
    }
}

#[tokio::test]
async fn initialization_pushes_identical_ids_to_every_node() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, true);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());
    let ids = coordinator.initialize().await.unwrap();

    let clusters_schema = ids.clusters_schema_id.clone().unwrap();
    let filtered_query = ids.cluster_subtract_query_id.clone().unwrap();
    let expected_schemas: HashSet<String> = [ids.schema_id.clone(), clusters_schema].into();
    let expected_queries: HashSet<String> = [ids.subtract_query_id.clone(), filtered_query].into();
    for node in &nodes {
        assert_eq!(node.schema_ids(), expected_schemas);
        assert_eq!(node.query_ids(), expected_queries);
        let tokens: HashSet<String> = node.calls("/schemas").into_iter().map(|c| c.token).collect();
        assert_eq!(tokens.len(), 1);
    }
    for index in 0..nodes.len() {
        assert_eq!(
            coordinator.registry().require(index, Identifier::Schema).unwrap(),
            ids.schema_id
        );
    }

    let mut saved = config.clone();
    saved.absorb(coordinator.registry());
    assert!(saved
        .nodes
        .iter()
        .all(|node| node.subtract_query_id.as_deref() == Some(ids.subtract_query_id.as_str())));
}

#[tokio::test]
async fn flush_empties_every_node() {
    let nodes = spawn_nodes(2).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());
    let ids = coordinator.initialize().await.unwrap();
    coordinator.upload_chunks(&corpus()[..5], 0).await.unwrap();
    assert_eq!(nodes[1].records(&ids.schema_id).len(), 5);

    coordinator.flush().await.unwrap();
    for node in &nodes {
        assert!(node.records(&ids.schema_id).is_empty());
        assert_eq!(node.calls("/data/flush").len(), 1);
    }
    assert!(matches!(
        coordinator.top_chunks(QUERY).await,
        Err(secretrag::RagError::NoResults)
    ));
}

#[tokio::test]
async fn equal_distances_keep_upload_order() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, false);
    let options = QueryOptions {
        num_chunks: 3,
        ..QueryOptions::default()
    };
    let mut coordinator = coordinator(&config, 100, options);
    coordinator.initialize().await.unwrap();

    let sharer = coordinator.session().sharer();
    let docs: [(&str, [f32; 3]); 4] = [
        ("far", [-1.0, 0.0, 0.0]),
        ("first", [0.5, 0.5, 0.0]),
        ("second", [0.5, 0.5, 0.0]),
        ("third", [0.5, 0.5, 0.0]),
    ];
    let embeddings: Vec<_> = docs
        .iter()
        .map(|(_, vector)| encrypt_vector(sharer, vector).unwrap())
        .collect();
    let chunks: Vec<_> = docs
        .iter()
        .map(|(text, _)| encrypt_bytes(sharer, text.as_bytes()))
        .collect();
    coordinator.write_documents(&embeddings, &chunks).await.unwrap();

    for _ in 0..3 {
        let results = coordinator
            .query()
            .top_chunks_for_embedding(coordinator.session(), &[0.5, 0.4, 0.0])
            .await
            .unwrap();
        let order: Vec<&str> = results.iter().map(|r| r.chunk.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert_eq!(results[0].distance, results[2].distance);
    }
}
