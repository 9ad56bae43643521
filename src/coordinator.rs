//! Facade tying the session to the initializer, the write pipeline and the query flow.

use std::sync::Arc;

use tracing::info;

use crate::clusters::{kmeans, DEFAULT_MAX_ITERATIONS};
use crate::config::{CoordinatorConfig, SessionOptions};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::init::{Initializer, SetupIds};
use crate::nodes::{Identifier, NodeRegistry};
use crate::query::{QueryCoordinator, QueryOptions, RetrievedChunk};
use crate::session::Session;
use crate::shares::{encrypt_bytes, encrypt_vector, ShareBundle};
use crate::write::{WritePipeline, WriteSummary};

/// Texts per embedder call during upload.
const EMBED_BATCH_SIZE: usize = 64;

/// Owns one session and exposes the setup, upload and query operations over it.
pub struct RagCoordinator {
    session: Session,
    initializer: Initializer,
    writer: WritePipeline,
    query: QueryCoordinator,
    embedder: Arc<dyn Embedder>,
}

impl RagCoordinator {
    /// Builds the session described by `config`.
    pub fn new(
        config: &CoordinatorConfig,
        options: &SessionOptions,
        embedder: Arc<dyn Embedder>,
        query_options: QueryOptions,
    ) -> Result<Self> {
        let session = config.build_session(options)?;
        Ok(Self::from_parts(
            session,
            Initializer::new(config.with_clustering),
            WritePipeline::default(),
            embedder,
            query_options,
        ))
    }

    /// Assembles a coordinator from an existing session.
    pub fn from_parts(
        session: Session,
        initializer: Initializer,
        writer: WritePipeline,
        embedder: Arc<dyn Embedder>,
        query_options: QueryOptions,
    ) -> Self {
        let query = QueryCoordinator::new(Arc::clone(&embedder), query_options);
        Self {
            session,
            initializer,
            writer,
            query,
            embedder,
        }
    }

    /// Underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Node registry, including identifiers generated by [`RagCoordinator::initialize`].
    pub fn registry(&self) -> &NodeRegistry {
        self.session.registry()
    }

    /// Query flow.
    pub fn query(&self) -> &QueryCoordinator {
        &self.query
    }

    /// Mutable query flow, e.g. to change options between calls.
    pub fn query_mut(&mut self) -> &mut QueryCoordinator {
        &mut self.query
    }

    /// Write pipeline.
    pub fn writer(&self) -> &WritePipeline {
        &self.writer
    }

    /// Creates schemas and queries on every node.
    pub async fn initialize(&mut self) -> Result<SetupIds> {
        self.initializer.bootstrap(&mut self.session).await
    }

    /// Embeds, optionally clusters, shares and uploads `chunks`.
    ///
    /// `clusters` above one runs k-means and tags every document with its label.
    pub async fn upload_chunks(&self, chunks: &[String], clusters: usize) -> Result<WriteSummary> {
        if chunks.is_empty() {
            return Err(RagError::Input("nothing to upload".into()));
        }
        let embeddings = self.embed_chunks(chunks).await?;
        let model = if clusters > 1 {
            if !self.registry().has(Identifier::ClustersSchema) {
                return Err(RagError::Config(
                    "clustering requested but no centroid schema is configured".into(),
                ));
            }
            let model = kmeans(&embeddings, clusters, DEFAULT_MAX_ITERATIONS)?;
            info!(clusters = model.centroids.len(), "assigned documents to clusters");
            Some(model)
        } else {
            None
        };

        let sharer = self.session.sharer();
        let embedding_shares: Vec<Vec<ShareBundle>> = embeddings
            .iter()
            .map(|embedding| encrypt_vector(sharer, embedding))
            .collect::<Result<_>>()?;
        let chunk_shares: Vec<ShareBundle> = chunks
            .iter()
            .map(|chunk| encrypt_bytes(sharer, chunk.as_bytes()))
            .collect();
        // k-means clamps k, so a tiny corpus may end up with a single cluster
        let assignment = model
            .as_ref()
            .filter(|model| model.centroids.len() > 1)
            .map(|model| model.assignment());
        self.writer
            .write_documents(&self.session, &embedding_shares, &chunk_shares, assignment)
            .await
    }

    /// Uploads pre-shared documents.
    pub async fn write_documents(
        &self,
        embedding_shares: &[Vec<ShareBundle>],
        chunk_shares: &[ShareBundle],
    ) -> Result<WriteSummary> {
        self.writer
            .write_documents(&self.session, embedding_shares, chunk_shares, None)
            .await
    }

    /// Deletes every document and, when configured, every centroid.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush(&self.session, Identifier::Schema).await?;
        if self.registry().has(Identifier::ClustersSchema) {
            self.writer
                .flush(&self.session, Identifier::ClustersSchema)
                .await?;
        }
        Ok(())
    }

    /// Top chunks for `query`, most relevant first.
    pub async fn top_chunks(&self, query: &str) -> Result<Vec<RetrievedChunk>> {
        self.query.top_chunks(&self.session, query).await
    }

    async fn embed_chunks(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = Arc::clone(&self.embedder);
        let owned = chunks.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
            let mut out = Vec::with_capacity(refs.len());
            for batch in refs.chunks(EMBED_BATCH_SIZE) {
                out.extend(embedder.embed_batch(batch)?);
            }
            Ok::<_, RagError>(out)
        })
        .await
        .map_err(|err| RagError::Embedding(format!("embedding task failed: {err}")))??;
        if embeddings.len() != chunks.len() {
            return Err(RagError::Embedding(format!(
                "received {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        Ok(embeddings)
    }
}
