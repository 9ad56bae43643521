//! Query-time flow: embed, prune by cluster, fan out the subtract query, rank by
//! reconstructed distance, then fetch and reveal the winning chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate_chunks, aggregate_differences, ScoredDocument};
use crate::clusters::{ClusterLocator, NearestClusters};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::nodes::{Identifier, NodeRegistry};
use crate::records::{ChunkRecord, DifferenceRecord};
use crate::session::Session;
use crate::shares::{encrypt_vector, split_by_node};

/// Knobs of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Chunks returned, most relevant first.
    pub num_chunks: usize,
    /// Nearest clusters searched when clustering is configured; `0` searches everything.
    pub num_clusters: usize,
    /// Keep going when some nodes fail the fan-out instead of failing immediately.
    pub allow_degraded: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            num_chunks: 2,
            num_clusters: 1,
            allow_degraded: false,
        }
    }
}

/// One ranked answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    /// Document id shared by every node.
    pub document_id: Uuid,
    /// Revealed chunk text.
    pub chunk: String,
    /// Euclidean distance between the query and the document embedding.
    pub distance: f64,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    id: &'a str,
    variables: ExecuteVariables<'a>,
}

#[derive(Serialize)]
struct ExecuteVariables<'a> {
    query_embedding: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    closest_centroids: Option<&'a [u32]>,
}

#[derive(Serialize)]
struct ReadBody<'a> {
    schema: &'a str,
    filter: serde_json::Value,
}

/// Runs queries against a [`Session`].
#[derive(Clone)]
pub struct QueryCoordinator {
    embedder: Arc<dyn Embedder>,
    locator: ClusterLocator,
    options: QueryOptions,
}

impl QueryCoordinator {
    /// Coordinator embedding queries with `embedder`.
    pub fn new(embedder: Arc<dyn Embedder>, options: QueryOptions) -> Self {
        Self {
            embedder,
            locator: ClusterLocator::default(),
            options,
        }
    }

    /// Options applied to every query.
    pub fn options(&self) -> QueryOptions {
        self.options
    }

    /// Replaces the options.
    pub fn set_options(&mut self, options: QueryOptions) {
        self.options = options;
    }

    /// Embeds `query` on the blocking pool.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let query = validate_query(query)?.to_string();
        let embedder = Arc::clone(&self.embedder);
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&query))
            .await
            .map_err(|err| RagError::Embedding(format!("embedding task failed: {err}")))??;
        if embedding.is_empty() {
            return Err(RagError::Embedding("embedder returned an empty vector".into()));
        }
        Ok(embedding)
    }

    /// The `num_chunks` chunks nearest to `query`, most relevant first.
    pub async fn top_chunks(&self, session: &Session, query: &str) -> Result<Vec<RetrievedChunk>> {
        let started = Instant::now();
        let embedding = self.embed_query(query).await?;
        phase("embedding", started);
        self.top_chunks_for_embedding(session, &embedding).await
    }

    /// Same as [`QueryCoordinator::top_chunks`] for an already embedded query.
    pub async fn top_chunks_for_embedding(
        &self,
        session: &Session,
        embedding: &[f32],
    ) -> Result<Vec<RetrievedChunk>> {
        self.search(session, embedding, self.options).await
    }

    /// Runs every phase after embedding with per-call `options`.
    pub async fn search(
        &self,
        session: &Session,
        embedding: &[f32],
        options: QueryOptions,
    ) -> Result<Vec<RetrievedChunk>> {
        if options.num_chunks == 0 {
            return Err(RagError::InvalidQuery("num_chunks must be at least 1".into()));
        }
        if embedding.is_empty() {
            return Err(RagError::InvalidQuery("query embedding is empty".into()));
        }
        let total = Instant::now();

        let started = Instant::now();
        let clusters = self.clustering(session, embedding, options.num_clusters).await?;
        phase("clustering", started);

        let started = Instant::now();
        let parties = session.registry().len();
        let query_shares = split_by_node(&encrypt_vector(session.sharer(), embedding)?, parties)?;
        phase("sharing", started);

        let started = Instant::now();
        let differences =
            fan_out_subtract(session, &query_shares, &clusters, options.allow_degraded).await?;
        phase("fanout", started);

        let started = Instant::now();
        let aggregated = aggregate_differences(session.sharer(), differences);
        if aggregated.incomplete > 0 || aggregated.rejected > 0 {
            warn!(
                incomplete = aggregated.incomplete,
                rejected = aggregated.rejected,
                "dropped documents that did not reconstruct"
            );
        }
        let mut ranked = aggregated.documents;
        if ranked.is_empty() {
            return Err(RagError::NoResults);
        }
        phase("aggregation", started);

        let started = Instant::now();
        rank(&mut ranked, options.num_chunks);
        phase("ranking", started);

        let started = Instant::now();
        let chunks = fetch_chunks(session, &ranked, options.allow_degraded).await?;
        phase("chunk_fetch", started);

        let started = Instant::now();
        let revealed = reveal_in_rank_order(session, &ranked, chunks);
        phase("reveal", started);

        if revealed.is_empty() {
            return Err(RagError::NoResults);
        }
        info!(
            results = revealed.len(),
            elapsed_ms = total.elapsed().as_millis() as u64,
            "query answered"
        );
        Ok(revealed)
    }

    async fn clustering(
        &self,
        session: &Session,
        embedding: &[f32],
        num_clusters: usize,
    ) -> Result<NearestClusters> {
        let registry = session.registry();
        let configured =
            registry.has(Identifier::ClustersSchema) && registry.has(Identifier::ClusterSubtractQuery);
        if !configured || num_clusters == 0 {
            return Ok(NearestClusters::unfiltered());
        }
        match self
            .locator
            .closest_centroids(session, embedding, num_clusters)
            .await
        {
            Ok(clusters) => Ok(clusters),
            Err(err @ (RagError::Transport { .. } | RagError::Protocol { .. })) => {
                warn!(error = %err, "centroid lookup failed; searching every cluster");
                Ok(NearestClusters::unfiltered())
            }
            Err(err) => Err(err),
        }
    }
}

async fn fan_out_subtract(
    session: &Session,
    query_shares: &[Vec<i64>],
    clusters: &NearestClusters,
    allow_degraded: bool,
) -> Result<Vec<Vec<DifferenceRecord>>> {
    let registry = session.registry();
    let which = if clusters.labels.is_some() {
        Identifier::ClusterSubtractQuery
    } else {
        Identifier::SubtractQuery
    };
    let query_ids = (0..registry.len())
        .map(|index| registry.require(index, which))
        .collect::<Result<Vec<&str>>>()?;
    let labels = clusters.labels.as_deref();
    let client = session.client();
    let results = session
        .fan_out(|index, node, token| {
            let body = ExecuteBody {
                id: query_ids[index],
                variables: ExecuteVariables {
                    query_embedding: &query_shares[index],
                    closest_centroids: labels,
                },
            };
            async move {
                client
                    .post_data::<_, DifferenceRecord>(node, &token, "queries/execute", &body)
                    .await
            }
        })
        .await;
    settle(registry, results, allow_degraded)
}

async fn fetch_chunks(
    session: &Session,
    ranked: &[ScoredDocument],
    allow_degraded: bool,
) -> Result<Vec<Vec<ChunkRecord>>> {
    let registry = session.registry();
    let schema_ids = (0..registry.len())
        .map(|index| registry.require(index, Identifier::Schema))
        .collect::<Result<Vec<&str>>>()?;
    let ids: Vec<String> = ranked.iter().map(|doc| doc.id.to_string()).collect();
    let filter = json!({"_id": {"$in": ids}});
    let client = session.client();
    let results = session
        .fan_out(|index, node, token| {
            let body = ReadBody {
                schema: schema_ids[index],
                filter: filter.clone(),
            };
            async move {
                client
                    .post_data::<_, ChunkRecord>(node, &token, "data/read", &body)
                    .await
            }
        })
        .await;
    settle(registry, results, allow_degraded)
}

/// Orders by ascending distance and keeps the first `limit`. The sort is stable, so equal
/// distances keep their aggregation order.
fn rank(documents: &mut Vec<ScoredDocument>, limit: usize) {
    documents.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    documents.truncate(limit);
}

fn validate_query(query: &str) -> Result<&str> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(RagError::InvalidQuery("query text is empty".into()));
    }
    Ok(trimmed)
}

fn phase(name: &'static str, started: Instant) {
    debug!(
        phase = name,
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "query phase finished"
    );
}

/// Resolves a fan-out. Node failures become [`RagError::NodeUnavailable`] unless
/// degraded mode is on, in which case a failed node contributes no rows.
fn settle<T>(
    registry: &NodeRegistry,
    results: Vec<Result<Vec<T>>>,
    allow_degraded: bool,
) -> Result<Vec<Vec<T>>> {
    let mut rows = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(data) => rows.push(data),
            Err(err @ (RagError::Transport { .. } | RagError::Protocol { .. })) => {
                let url = registry
                    .get(index)
                    .map(|node| node.url.clone())
                    .unwrap_or_else(|| format!("#{index}"));
                warn!(node = %url, error = %err, "node failed during fan-out");
                failed.push(url);
                rows.push(Vec::new());
            }
            Err(err) => return Err(err),
        }
    }
    if !failed.is_empty() && !allow_degraded {
        return Err(RagError::NodeUnavailable { nodes: failed });
    }
    Ok(rows)
}

fn reveal_in_rank_order(
    session: &Session,
    ranked: &[ScoredDocument],
    per_node: Vec<Vec<ChunkRecord>>,
) -> Vec<RetrievedChunk> {
    let aggregated = aggregate_chunks(session.sharer(), per_node);
    if aggregated.incomplete > 0 || aggregated.rejected > 0 {
        warn!(
            incomplete = aggregated.incomplete,
            rejected = aggregated.rejected,
            "dropped chunks that did not reconstruct"
        );
    }
    let mut chunks: HashMap<Uuid, Vec<u8>> = aggregated.documents.into_iter().collect();
    ranked
        .iter()
        .filter_map(|doc| {
            let bytes = chunks.remove(&doc.id)?;
            match String::from_utf8(bytes) {
                Ok(chunk) => Some(RetrievedChunk {
                    document_id: doc.id,
                    chunk,
                    distance: doc.distance,
                }),
                Err(err) => {
                    warn!(document = %doc.id, error = %err, "dropping chunk that is not UTF-8");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Node;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(vec![Node::new("http://a", "did:a"), Node::new("http://b", "did:b")])
            .unwrap()
    }

    fn protocol(node: &str) -> RagError {
        RagError::Protocol {
            node: node.into(),
            detail: "returned 500".into(),
        }
    }

    #[test]
    fn empty_query_is_rejected() {
        assert!(matches!(validate_query("  \n"), Err(RagError::InvalidQuery(_))));
        assert_eq!(validate_query(" Asia ").unwrap(), "Asia");
    }

    #[test]
    fn failed_node_is_unavailable_unless_degraded() {
        let results = || vec![Ok(vec![1u8]), Err(protocol("http://b"))];
        match settle(&registry(), results(), false) {
            Err(RagError::NodeUnavailable { nodes }) => assert_eq!(nodes, vec!["http://b"]),
            other => panic!("unexpected {other:?}"),
        }
        let rows = settle(&registry(), results(), true).unwrap();
        assert_eq!(rows, vec![vec![1u8], vec![]]);
    }

    #[test]
    fn config_errors_are_not_node_failures() {
        let results: Vec<Result<Vec<u8>>> = vec![Ok(vec![]), Err(RagError::Config("x".into()))];
        assert!(matches!(
            settle(&registry(), results, true),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn ties_keep_aggregation_order() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut documents = vec![
            ScoredDocument { id: ids[0], distance: 0.5 },
            ScoredDocument { id: ids[1], distance: 0.25 },
            ScoredDocument { id: ids[2], distance: 0.5 },
            ScoredDocument { id: ids[3], distance: 0.25 },
        ];
        rank(&mut documents, 3);
        let order: Vec<Uuid> = documents.iter().map(|doc| doc.id).collect();
        assert_eq!(order, vec![ids[1], ids[3], ids[0]]);
    }

    #[test]
    fn default_options() {
        let options = QueryOptions::default();
        assert_eq!(options.num_chunks, 2);
        assert!(!options.allow_degraded);
    }
}
