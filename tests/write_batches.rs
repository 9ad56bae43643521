mod common;

use std::collections::HashSet;

use pretty_assertions::assert_eq;
use secretrag::shares::{encrypt_bytes, encrypt_vector};
use secretrag::{QueryOptions, RagCoordinator, RagError, ShareBundle};

use common::{config_for, coordinator, spawn_nodes};

fn shares(coordinator: &RagCoordinator, count: usize) -> (Vec<Vec<ShareBundle>>, Vec<ShareBundle>) {
    let sharer = coordinator.session().sharer();
    let embeddings = (0..count)
        .map(|i| encrypt_vector(sharer, &[i as f32 / 10.0, 1.0, -0.5]).unwrap())
        .collect();
    let chunks = (0..count)
        .map(|i| encrypt_bytes(sharer, format!("chunk {i}").as_bytes()))
        .collect();
    (embeddings, chunks)
}

#[tokio::test]
async fn large_uploads_are_split_into_batches() {
    let nodes = spawn_nodes(2).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());
    let ids = coordinator.initialize().await.unwrap();

    let (embeddings, chunks) = shares(&coordinator, 250);
    let summary = coordinator.write_documents(&embeddings, &chunks).await.unwrap();
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.document_ids.len(), 250);
    assert!(summary.centroid_ids.is_empty());

    for node in &nodes {
        let sizes: Vec<usize> = node
            .calls("/data/create")
            .iter()
            .map(|call| call.body["data"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(node.records(&ids.schema_id).len(), 250);
    }
}

#[tokio::test]
async fn replaying_with_the_same_ids_does_not_duplicate() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 4, QueryOptions::default());
    let ids = coordinator.initialize().await.unwrap();

    let (embeddings, chunks) = shares(&coordinator, 10);
    let first = coordinator.write_documents(&embeddings, &chunks).await.unwrap();
    let replay = coordinator
        .writer()
        .write_documents_with_ids(coordinator.session(), &first.document_ids, &embeddings, &chunks, None)
        .await
        .unwrap();
    assert_eq!(replay.document_ids, first.document_ids);

    let expected: HashSet<String> = first.document_ids.iter().map(|id| id.to_string()).collect();
    for node in &nodes {
        let stored: HashSet<String> = node
            .records(&ids.schema_id)
            .iter()
            .map(|record| record["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(stored, expected);
        assert_eq!(node.records(&ids.schema_id).len(), 10);
    }
}

#[tokio::test]
async fn every_node_receives_its_own_shares() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());
    let ids = coordinator.initialize().await.unwrap();

    let (embeddings, chunks) = shares(&coordinator, 1);
    coordinator.write_documents(&embeddings, &chunks).await.unwrap();

    let stored: Vec<_> = nodes
        .iter()
        .map(|node| node.records(&ids.schema_id).remove(0))
        .collect();
    assert_eq!(stored[0]["_id"], stored[1]["_id"]);
    assert_eq!(stored[1]["_id"], stored[2]["_id"]);
    assert_ne!(stored[0]["embedding"], stored[1]["embedding"]);
    for (index, node) in nodes.iter().enumerate() {
        let call = node.calls("/data/create").remove(0);
        assert_eq!(call.token, format!("token-{index}"));
    }
}

#[tokio::test]
async fn mismatched_inputs_send_nothing() {
    let nodes = spawn_nodes(2).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 100, QueryOptions::default());
    coordinator.initialize().await.unwrap();

    let (embeddings, mut chunks) = shares(&coordinator, 5);
    chunks.pop();
    assert!(matches!(
        coordinator.write_documents(&embeddings, &chunks).await,
        Err(RagError::Input(_))
    ));
    assert!(nodes.iter().all(|node| node.calls("/data/create").is_empty()));
}

#[tokio::test]
async fn narrow_chunk_bundle_is_rejected_before_any_batch() {
    let nodes = spawn_nodes(3).await;
    let config = config_for(&nodes, false);
    let mut coordinator = coordinator(&config, 2, QueryOptions::default());
    coordinator.initialize().await.unwrap();

    let (embeddings, mut chunks) = shares(&coordinator, 4);
    chunks[3].pop();
    assert!(matches!(
        coordinator.write_documents(&embeddings, &chunks).await,
        Err(RagError::Input(_))
    ));
    assert!(nodes.iter().all(|node| node.calls("/data/create").is_empty()));
}

#[tokio::test]
async fn embeddings_outside_the_share_range_are_rejected() {
    let nodes = spawn_nodes(2).await;
    let config = config_for(&nodes, false);
    let coordinator = coordinator(&config, 100, QueryOptions::default());
    let sharer = coordinator.session().sharer();
    assert!(matches!(
        encrypt_vector(sharer, &[0.1, 500.0]),
        Err(RagError::Input(_))
    ));
}
