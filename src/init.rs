//! One-time creation of schemas and the subtract query on every node.
//!
//! Each operation mints one UUID and pushes it to all nodes concurrently, so the
//! identifier matches across nodes. Setup is all-or-nothing: if any node rejects the
//! request the identifier is not recorded in the registry.

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::nodes::Identifier;
use crate::session::Session;

/// Creates the document schema, centroid schema and subtract queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initializer {
    with_clustering: bool,
}

/// Identifiers produced by [`Initializer::bootstrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIds {
    /// Document schema.
    pub schema_id: String,
    /// Unfiltered subtract query.
    pub subtract_query_id: String,
    /// Centroid schema, when clustering is enabled.
    pub clusters_schema_id: Option<String>,
    /// Cluster-filtered subtract query, when clustering is enabled.
    pub cluster_subtract_query_id: Option<String>,
}

impl Initializer {
    /// Initializer that also prepares clustering artifacts when `with_clustering`.
    pub fn new(with_clustering: bool) -> Self {
        Self { with_clustering }
    }

    /// Whether clustering artifacts are created.
    pub fn with_clustering(&self) -> bool {
        self.with_clustering
    }

    /// Runs every setup step in dependency order.
    pub async fn bootstrap(&self, session: &mut Session) -> Result<SetupIds> {
        let schema_id = self.create_document_schema(session).await?;
        let subtract_query_id = self.create_subtract_query(session, false).await?;
        let (clusters_schema_id, cluster_subtract_query_id) = if self.with_clustering {
            let clusters = self.create_centroid_schema(session).await?;
            let query = self.create_subtract_query(session, true).await?;
            (Some(clusters), Some(query))
        } else {
            (None, None)
        };
        Ok(SetupIds {
            schema_id,
            subtract_query_id,
            clusters_schema_id,
            cluster_subtract_query_id,
        })
    }

    /// Registers the document schema on every node.
    pub async fn create_document_schema(&self, session: &mut Session) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = document_schema(&id);
        push_to_all(session, "schemas", body).await?;
        session.registry_mut().assign(Identifier::Schema, &id);
        info!(schema_id = %id, "created document schema");
        Ok(id)
    }

    /// Registers the centroid schema on every node.
    pub async fn create_centroid_schema(&self, session: &mut Session) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = centroid_schema(&id);
        push_to_all(session, "schemas", body).await?;
        session.registry_mut().assign(Identifier::ClustersSchema, &id);
        info!(clusters_schema_id = %id, "created centroid schema");
        Ok(id)
    }

    /// Registers the subtract pipeline, optionally preceded by the cluster filter.
    pub async fn create_subtract_query(
        &self,
        session: &mut Session,
        with_cluster_filter: bool,
    ) -> Result<String> {
        if !session.registry().has(Identifier::Schema) {
            return Err(RagError::Config(
                "document schema must exist before the subtract query".into(),
            ));
        }
        let schema_id = session.registry().require(0, Identifier::Schema)?.to_string();
        let id = Uuid::new_v4().to_string();
        let body = subtract_query(&id, &schema_id, with_cluster_filter);
        push_to_all(session, "queries", body).await?;
        let slot = if with_cluster_filter {
            Identifier::ClusterSubtractQuery
        } else {
            Identifier::SubtractQuery
        };
        session.registry_mut().assign(slot, &id);
        info!(query_id = %id, with_cluster_filter, "created subtract query");
        Ok(id)
    }
}

async fn push_to_all(session: &Session, path: &str, body: Value) -> Result<()> {
    let bodies = vec![body; session.registry().len()];
    session.post_all(path, &bodies).await
}

/// Body of `POST /schemas` for documents.
pub fn document_schema(id: &str) -> Value {
    json!({
        "_id": id,
        "name": "secretrag documents",
        "keys": ["_id"],
        "schema": {
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "DOCUMENTS",
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "_id": {"type": "string", "format": "uuid", "coerce": true},
                    "embedding": {
                        "description": "Embedding shares",
                        "type": "array",
                        "items": {"type": "integer"}
                    },
                    "chunk": {
                        "description": "Chunk share, base64",
                        "type": "string"
                    },
                    "cluster_centroid": {
                        "description": "Cluster label",
                        "type": "integer"
                    }
                },
                "required": ["_id", "embedding", "chunk"],
                "additionalProperties": false
            }
        }
    })
}

/// Body of `POST /schemas` for centroids.
pub fn centroid_schema(id: &str) -> Value {
    json!({
        "_id": id,
        "name": "secretrag cluster centroids",
        "keys": ["_id"],
        "schema": {
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "CLUSTER CENTROIDS",
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "_id": {"type": "string", "format": "uuid", "coerce": true},
                    "label": {"type": "integer"},
                    "cluster_centroid": {
                        "description": "Fixed-point centroid",
                        "type": "array",
                        "items": {"type": "integer"}
                    }
                },
                "required": ["_id", "label", "cluster_centroid"],
                "additionalProperties": false
            }
        }
    })
}

/// Body of `POST /queries` for the subtract pipeline.
pub fn subtract_query(id: &str, schema_id: &str, with_cluster_filter: bool) -> Value {
    let mut variables = json!({
        "query_embedding": {
            "description": "Query embedding share",
            "type": "array",
            "items": {"type": "number"}
        }
    });
    let mut pipeline = vec![json!({"$addFields": {"query_embedding": "##query_embedding"}})];
    if with_cluster_filter {
        variables["closest_centroids"] = json!({
            "description": "Cluster labels to keep",
            "type": "array",
            "items": {"type": "number"}
        });
        pipeline.push(json!({
            "$match": {"$expr": {"$in": ["$cluster_centroid", "##closest_centroids"]}}
        }));
    }
    pipeline.push(json!({
        "$project": {
            "_id": 1,
            "difference": {
                "$map": {
                    "input": {"$zip": {"inputs": ["$embedding", "$query_embedding"]}},
                    "as": "pair",
                    "in": {
                        "$subtract": [
                            {"$arrayElemAt": ["$$pair", 0]},
                            {"$arrayElemAt": ["$$pair", 1]}
                        ]
                    }
                }
            }
        }
    }));
    let name = if with_cluster_filter {
        "Difference between stored and query embedding shares, filtered by cluster"
    } else {
        "Difference between stored and query embedding shares"
    };
    json!({
        "_id": id,
        "name": name,
        "schema": schema_id,
        "variables": variables,
        "pipeline": pipeline,
    })
}
