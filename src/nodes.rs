//! Registry of storage nodes, one per share-holding party.

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Connection details and generated identifiers for one storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Base URL, without trailing slash.
    pub url: String,
    /// Audience identifier used when signing this node's tokens.
    pub did: String,
    /// Pre-issued token used when no organization key is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Document schema identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    /// Unfiltered subtract query identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtract_query_id: Option<String>,
    /// Centroid schema identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters_schema_id: Option<String>,
    /// Subtract query identifier with the cluster filter stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_subtract_query_id: Option<String>,
}

impl Node {
    /// Node with no generated identifiers yet.
    pub fn new(url: impl Into<String>, did: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            did: did.into(),
            bearer_token: None,
            schema_id: None,
            subtract_query_id: None,
            clusters_schema_id: None,
            cluster_subtract_query_id: None,
        }
    }

    /// Full URL of `path` on this node.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Which generated identifier an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    /// [`Node::schema_id`].
    Schema,
    /// [`Node::subtract_query_id`].
    SubtractQuery,
    /// [`Node::clusters_schema_id`].
    ClustersSchema,
    /// [`Node::cluster_subtract_query_id`].
    ClusterSubtractQuery,
}

impl Identifier {
    fn label(self) -> &'static str {
        match self {
            Identifier::Schema => "schema_id",
            Identifier::SubtractQuery => "subtract_query_id",
            Identifier::ClustersSchema => "clusters_schema_id",
            Identifier::ClusterSubtractQuery => "cluster_subtract_query_id",
        }
    }

    fn get(self, node: &Node) -> Option<&str> {
        match self {
            Identifier::Schema => node.schema_id.as_deref(),
            Identifier::SubtractQuery => node.subtract_query_id.as_deref(),
            Identifier::ClustersSchema => node.clusters_schema_id.as_deref(),
            Identifier::ClusterSubtractQuery => node.cluster_subtract_query_id.as_deref(),
        }
    }

    fn slot(self, node: &mut Node) -> &mut Option<String> {
        match self {
            Identifier::Schema => &mut node.schema_id,
            Identifier::SubtractQuery => &mut node.subtract_query_id,
            Identifier::ClustersSchema => &mut node.clusters_schema_id,
            Identifier::ClusterSubtractQuery => &mut node.cluster_subtract_query_id,
        }
    }
}

/// Ordered node list; index `i` holds the `i`-th share of every value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
}

impl NodeRegistry {
    /// Validates and wraps the node list.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RagError::Config("node list is empty".into()));
        }
        for node in &nodes {
            if !(node.url.starts_with("http://") || node.url.starts_with("https://")) {
                return Err(RagError::Config(format!(
                    "node url {} must be an http(s) URL",
                    node.url
                )));
            }
        }
        let nodes = nodes
            .into_iter()
            .map(|mut node| {
                node.url = node.url.trim_end_matches('/').to_string();
                node
            })
            .collect();
        Ok(Self { nodes })
    }

    /// Number of parties.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a constructed registry.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node at party index `index`.
    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// All nodes in party order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Iterates nodes in party order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Returns the identifier of `node`, or a config error naming it.
    pub fn require(&self, index: usize, which: Identifier) -> Result<&str> {
        let node = self
            .nodes
            .get(index)
            .ok_or_else(|| RagError::Config(format!("no node at index {index}")))?;
        which
            .get(node)
            .ok_or_else(|| RagError::Config(format!("node {} is missing {}", node.url, which.label())))
    }

    /// True when every node carries the identifier.
    pub fn has(&self, which: Identifier) -> bool {
        self.nodes.iter().all(|node| which.get(node).is_some())
    }

    /// Records an identifier that was pushed to every node.
    pub fn assign(&mut self, which: Identifier, id: &str) {
        for node in &mut self.nodes {
            *which.slot(node) = Some(id.to_string());
        }
    }

    /// Unwraps the node list, e.g. for persisting it.
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}
