//! Cluster pruning: locating the centroids nearest to a query, and the k-means pass
//! the data owner runs before upload.

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::fixed_point::{encode_vector, from_fixed_point, to_fixed_point};
use crate::nodes::Identifier;
use crate::records::CentroidRecord;
use crate::session::Session;
use crate::write::ClusterAssignment;

/// Default Lloyd iteration cap for [`kmeans`].
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

#[derive(Serialize)]
struct ReadBody<'a> {
    schema: &'a str,
    filter: serde_json::Value,
}

/// Result of [`ClusterLocator::closest_centroids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearestClusters {
    /// Centroids stored on the node.
    pub total: usize,
    /// Labels to keep, nearest first; `None` means search unfiltered.
    pub labels: Option<Vec<u32>>,
}

impl NearestClusters {
    /// No clustering in effect.
    pub fn unfiltered() -> Self {
        Self {
            total: 0,
            labels: None,
        }
    }
}

/// Reads the replicated centroid set from a single node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterLocator {
    node_index: usize,
}

impl ClusterLocator {
    /// Locator reading from party `node_index`.
    pub fn new(node_index: usize) -> Self {
        Self { node_index }
    }

    /// Every centroid stored under the centroid schema.
    pub async fn fetch_centroids(&self, session: &Session) -> Result<Vec<CentroidRecord>> {
        let registry = session.registry();
        let schema_id = registry.require(self.node_index, Identifier::ClustersSchema)?;
        let node = registry
            .get(self.node_index)
            .ok_or_else(|| RagError::Config(format!("no node at index {}", self.node_index)))?;
        let token = session.token(self.node_index)?;
        let body = ReadBody {
            schema: schema_id,
            filter: json!({}),
        };
        session
            .client()
            .post_data(node, &token, "data/read", &body)
            .await
    }

    /// Labels of the `k` centroids nearest to `query`.
    ///
    /// Returns [`NearestClusters::unfiltered`] when `k` is zero or no centroid is stored.
    pub async fn closest_centroids(
        &self,
        session: &Session,
        query: &[f32],
        k: usize,
    ) -> Result<NearestClusters> {
        if k == 0 {
            return Ok(NearestClusters::unfiltered());
        }
        let centroids = self.fetch_centroids(session).await?;
        if centroids.is_empty() {
            debug!("no centroids stored; searching unfiltered");
            return Ok(NearestClusters::unfiltered());
        }
        let total = centroids.len();
        let labels = nearest_labels(&encode_vector(query), &centroids, k)?;
        debug!(total, kept = labels.len(), "selected nearest clusters");
        Ok(NearestClusters {
            total,
            labels: Some(labels),
        })
    }
}

/// Ranks centroids by fixed-point Euclidean distance to `query`; ties go to the lower label.
pub fn nearest_labels(query: &[i64], centroids: &[CentroidRecord], k: usize) -> Result<Vec<u32>> {
    let mut scored = Vec::with_capacity(centroids.len());
    for centroid in centroids {
        if centroid.cluster_centroid.len() != query.len() {
            return Err(RagError::Protocol {
                node: "centroids".into(),
                detail: format!(
                    "centroid {} has {} dimensions, query has {}",
                    centroid.label,
                    centroid.cluster_centroid.len(),
                    query.len()
                ),
            });
        }
        let distance = fixed_point_distance(query, &centroid.cluster_centroid);
        scored.push((distance, centroid.label));
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    Ok(scored.into_iter().take(k).map(|(_, label)| label).collect())
}

fn fixed_point_distance(a: &[i64], b: &[i64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Output of [`kmeans`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterModel {
    /// Cluster label per input vector.
    pub labels: Vec<u32>,
    /// Fixed-point centroid per label.
    pub centroids: Vec<Vec<i64>>,
}

impl ClusterModel {
    /// Borrowed view handed to the write pipeline.
    pub fn assignment(&self) -> ClusterAssignment<'_> {
        ClusterAssignment {
            labels: &self.labels,
            centroids: &self.centroids,
        }
    }

    /// Centroids decoded back to floats.
    pub fn float_centroids(&self) -> Vec<Vec<f64>> {
        self.centroids
            .iter()
            .map(|c| c.iter().copied().map(from_fixed_point).collect())
            .collect()
    }
}

/// Lloyd's k-means seeded with the first `k` vectors.
///
/// Deterministic for a given input order. `k` is clamped to the number of vectors.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, max_iterations: usize) -> Result<ClusterModel> {
    if vectors.is_empty() || k == 0 {
        return Err(RagError::Input("k-means needs at least one vector and one cluster".into()));
    }
    let dims = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dims) {
        return Err(RagError::Input("k-means vectors differ in dimension".into()));
    }
    let k = k.min(vectors.len());
    let mut centroids: Vec<Vec<f64>> = vectors[..k]
        .iter()
        .map(|v| v.iter().map(|x| f64::from(*x)).collect())
        .collect();
    let mut labels = vec![0u32; vectors.len()];

    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (slot, vector) in labels.iter_mut().zip(vectors) {
            let best = nearest(&centroids, vector);
            if *slot != best {
                changed = true;
                *slot = best;
            }
        }

        let mut sums = vec![vec![0f64; dims]; k];
        let mut counts = vec![0usize; k];
        for (label, vector) in labels.iter().zip(vectors) {
            let label = *label as usize;
            counts[label] += 1;
            for (acc, x) in sums[label].iter_mut().zip(vector) {
                *acc += f64::from(*x);
            }
        }
        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(&counts) {
            // empty clusters keep their previous position
            if *count > 0 {
                *centroid = sum.into_iter().map(|s| s / *count as f64).collect();
            }
        }

        if !changed && iteration > 0 {
            debug!(iterations = iteration + 1, "k-means converged");
            break;
        }
    }

    let centroids = centroids
        .into_iter()
        .map(|c| c.into_iter().map(to_fixed_point).collect())
        .collect();
    Ok(ClusterModel { labels, centroids })
}

fn nearest(centroids: &[Vec<f64>], vector: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_distance = f64::INFINITY;
    for (index, centroid) in centroids.iter().enumerate() {
        let distance: f64 = centroid
            .iter()
            .zip(vector)
            .map(|(c, x)| {
                let d = c - f64::from(*x);
                d * d
            })
            .sum();
        if distance < best_distance {
            best = index;
            best_distance = distance;
        }
    }
    best as u32
}
