//! Batched upload of document shares and centroid records.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::nodes::Identifier;
use crate::records::{encode_chunk, CentroidRecord, DocumentRecord};
use crate::session::Session;
use crate::shares::{split_by_node, ShareBundle};

/// Documents per create call when the caller does not choose.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Serialize)]
struct CreateBody<'a, T> {
    schema: &'a str,
    data: &'a [T],
}

#[derive(Serialize)]
struct FlushBody<'a> {
    schema: &'a str,
}

/// Cluster assignment that accompanies an upload.
#[derive(Debug, Clone, Copy)]
pub struct ClusterAssignment<'a> {
    /// Label per document, index-aligned with the documents.
    pub labels: &'a [u32],
    /// Fixed-point centroid per label.
    pub centroids: &'a [Vec<i64>],
}

/// What an upload wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Id of every document, in input order. Replaying them rewrites the same records.
    pub document_ids: Vec<Uuid>,
    /// Number of sequential batches sent.
    pub batches: usize,
    /// Ids of the centroid records, in label order.
    pub centroid_ids: Vec<Uuid>,
}

/// Uploads documents in sequential batches, each batch fanned out to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePipeline {
    batch_size: usize,
}

impl Default for WritePipeline {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl WritePipeline {
    /// Pipeline sending `batch_size` documents per create call.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Uploads documents under freshly minted ids.
    ///
    /// `embedding_shares[d]` holds one bundle per embedding element of document `d`;
    /// `chunk_shares[d]` holds its chunk bundle. Batches are not rolled back on failure.
    pub async fn write_documents(
        &self,
        session: &Session,
        embedding_shares: &[Vec<ShareBundle>],
        chunk_shares: &[ShareBundle],
        clustering: Option<ClusterAssignment<'_>>,
    ) -> Result<WriteSummary> {
        let ids: Vec<Uuid> = (0..embedding_shares.len()).map(|_| Uuid::new_v4()).collect();
        self.write_documents_with_ids(session, &ids, embedding_shares, chunk_shares, clustering)
            .await
    }

    /// Uploads documents under caller-supplied ids, e.g. to replay a failed upload.
    pub async fn write_documents_with_ids(
        &self,
        session: &Session,
        ids: &[Uuid],
        embedding_shares: &[Vec<ShareBundle>],
        chunk_shares: &[ShareBundle],
        clustering: Option<ClusterAssignment<'_>>,
    ) -> Result<WriteSummary> {
        let parties = session.registry().len();
        check_inputs(parties, ids, embedding_shares, chunk_shares, clustering)?;
        let schema_id = session.registry().require(0, Identifier::Schema)?.to_string();

        let total = embedding_shares.len();
        let batches = total.div_ceil(self.batch_size);
        for (batch_index, start) in (0..total).step_by(self.batch_size).enumerate() {
            let end = (start + self.batch_size).min(total);
            info!(
                batch = batch_index + 1,
                of = batches,
                start,
                end,
                "uploading document batch"
            );
            let mut per_node: Vec<Vec<DocumentRecord>> =
                vec![Vec::with_capacity(end - start); parties];
            for doc in start..end {
                let embeddings = split_by_node(&embedding_shares[doc], parties)?;
                let label = clustering.map(|c| c.labels[doc]);
                for (node, embedding) in embeddings.into_iter().enumerate() {
                    let chunk = chunk_shares[doc][node].as_bytes().ok_or_else(|| {
                        RagError::Input(format!("document {doc} has a non-bytes chunk share"))
                    })?;
                    per_node[node].push(DocumentRecord {
                        id: ids[doc],
                        embedding,
                        chunk: encode_chunk(chunk),
                        cluster_centroid: label,
                    });
                }
            }
            let bodies: Vec<CreateBody<'_, DocumentRecord>> = per_node
                .iter()
                .map(|data| CreateBody {
                    schema: &schema_id,
                    data,
                })
                .collect();
            if let Err(err) = session.post_all("data/create", &bodies).await {
                warn!(batch = batch_index + 1, error = %err, "document batch failed");
                return Err(err);
            }
        }

        let centroid_ids = match clustering {
            Some(clustering) => self.write_centroids(session, clustering.centroids).await?,
            None => Vec::new(),
        };
        Ok(WriteSummary {
            document_ids: ids.to_vec(),
            batches,
            centroid_ids,
        })
    }

    /// Writes one record per centroid to the centroid schema of every node.
    pub async fn write_centroids(&self, session: &Session, centroids: &[Vec<i64>]) -> Result<Vec<Uuid>> {
        let schema_id = session
            .registry()
            .require(0, Identifier::ClustersSchema)?
            .to_string();
        let records: Vec<CentroidRecord> = centroids
            .iter()
            .enumerate()
            .map(|(label, centroid)| CentroidRecord {
                id: Uuid::new_v4(),
                label: label as u32,
                cluster_centroid: centroid.clone(),
            })
            .collect();
        let body = CreateBody {
            schema: &schema_id,
            data: &records,
        };
        let bodies: Vec<&CreateBody<'_, CentroidRecord>> =
            (0..session.registry().len()).map(|_| &body).collect();
        session.post_all("data/create", &bodies).await?;
        info!(count = records.len(), "uploaded cluster centroids");
        Ok(records.into_iter().map(|record| record.id).collect())
    }

    /// Deletes every record under the schema identified by `which` on every node.
    pub async fn flush(&self, session: &Session, which: Identifier) -> Result<()> {
        let schema_id = session.registry().require(0, which)?.to_string();
        let body = FlushBody { schema: &schema_id };
        let bodies: Vec<&FlushBody<'_>> = (0..session.registry().len()).map(|_| &body).collect();
        session.post_all("data/flush", &bodies).await?;
        info!(schema_id = %schema_id, "flushed schema");
        Ok(())
    }
}

fn check_inputs(
    parties: usize,
    ids: &[Uuid],
    embedding_shares: &[Vec<ShareBundle>],
    chunk_shares: &[ShareBundle],
    clustering: Option<ClusterAssignment<'_>>,
) -> Result<()> {
    if embedding_shares.len() != chunk_shares.len() {
        return Err(RagError::Input(format!(
            "mismatch: {} embeddings vs {} chunks",
            embedding_shares.len(),
            chunk_shares.len()
        )));
    }
    if ids.len() != embedding_shares.len() {
        return Err(RagError::Input(format!(
            "mismatch: {} ids vs {} documents",
            ids.len(),
            embedding_shares.len()
        )));
    }
    for (doc, chunk) in chunk_shares.iter().enumerate() {
        if chunk.len() != parties {
            return Err(RagError::Input(format!(
                "document {doc} has {} chunk shares for {parties} nodes",
                chunk.len()
            )));
        }
    }
    for (doc, embedding) in embedding_shares.iter().enumerate() {
        if let Some(bundle) = embedding.iter().find(|bundle| bundle.len() != parties) {
            return Err(RagError::Input(format!(
                "document {doc} has {} embedding shares for {parties} nodes",
                bundle.len()
            )));
        }
    }
    if let Some(clustering) = clustering {
        if clustering.labels.len() != embedding_shares.len() {
            return Err(RagError::Input(format!(
                "mismatch: {} labels vs {} embeddings",
                clustering.labels.len(),
                embedding_shares.len()
            )));
        }
        if clustering.centroids.len() <= 1 {
            return Err(RagError::Input(
                "clustering needs more than one centroid".into(),
            ));
        }
        if let Some(label) = clustering
            .labels
            .iter()
            .find(|label| **label as usize >= clustering.centroids.len())
        {
            return Err(RagError::Input(format!(
                "label {label} has no centroid ({} centroids)",
                clustering.centroids.len()
            )));
        }
    }
    Ok(())
}
