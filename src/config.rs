//! Coordinator configuration: the node list, organization identity and feature switches.
//!
//! Loaded once at process start and handed to [`crate::RagCoordinator::new`] by reference.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{TokenProvider, DEFAULT_TOKEN_TTL};
use crate::client::{NodeClient, NodeClientSettings};
use crate::error::{RagError, Result};
use crate::nodes::{Node, NodeRegistry};
use crate::session::Session;
use crate::shares::AdditiveSharing;

/// Persisted coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Storage nodes in party order.
    pub nodes: Vec<Node>,
    /// Issuer of signed tokens; falls back to static node tokens when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_did: Option<String>,
    /// Whether initialization creates the centroid schema and filtered query.
    #[serde(default)]
    pub with_clustering: bool,
}

/// Secrets and transport knobs that are not persisted with the config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Hex secp256k1 organization key.
    pub org_secret_key: Option<String>,
    /// Lifetime of signed tokens.
    pub token_ttl: Duration,
    /// Timeout and retry budget for node calls.
    pub client: NodeClientSettings,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            org_secret_key: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            client: NodeClientSettings::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Config for `nodes` with no generated identifiers.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            org_did: None,
            with_clustering: false,
        }
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RagError::Config(format!("failed to read {}: {err}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| RagError::Config(format!("invalid config {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON, replacing the file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| RagError::Config(format!("failed to encode config: {err}")))?;
        fs::write(path, json + "\n")
            .map_err(|err| RagError::Config(format!("failed to write {}: {err}", path.display())))?;
        info!(path = %path.display(), "saved coordinator config");
        Ok(())
    }

    /// Checks the node list without touching the network.
    pub fn validate(&self) -> Result<()> {
        NodeRegistry::new(self.nodes.clone()).map(|_| ())
    }

    /// Copies generated identifiers back from a registry.
    pub fn absorb(&mut self, registry: &NodeRegistry) {
        self.nodes = registry.nodes().to_vec();
    }

    /// Builds a session sharing values across every configured node.
    pub fn build_session(&self, options: &SessionOptions) -> Result<Session> {
        let registry = NodeRegistry::new(self.nodes.clone())?;
        let tokens = match (&options.org_secret_key, &self.org_did) {
            (Some(key), Some(did)) => TokenProvider::from_hex_key(key, did, options.token_ttl)?,
            (Some(_), None) => {
                return Err(RagError::Config(
                    "an organization key was supplied without org_did".into(),
                ))
            }
            (None, _) => {
                if let Some(node) = registry.iter().find(|node| node.bearer_token.is_none()) {
                    return Err(RagError::Config(format!(
                        "node {} has no bearer_token and no organization key was supplied",
                        node.url
                    )));
                }
                TokenProvider::static_tokens()
            }
        };
        let client = NodeClient::new(options.client)?;
        let sharer = Arc::new(AdditiveSharing::new(registry.len())?);
        Session::new(registry, tokens, client, sharer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Identifier;
    use pretty_assertions::assert_eq;

    fn sample() -> CoordinatorConfig {
        let mut a = Node::new("http://127.0.0.1:9001", "did:nil:a");
        a.bearer_token = Some("token-a".into());
        let mut b = Node::new("http://127.0.0.1:9002", "did:nil:b");
        b.bearer_token = Some("token-b".into());
        CoordinatorConfig::new(vec![a, b])
    }

    #[test]
    fn save_and_load_preserve_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = sample();
        let mut registry = NodeRegistry::new(config.nodes.clone()).unwrap();
        registry.assign(Identifier::Schema, "schema-1");
        config.absorb(&registry);
        config.save(&path).unwrap();
        let loaded = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.nodes[1].schema_id.as_deref(), Some("schema-1"));
    }

    #[test]
    fn empty_node_list_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"nodes": []}"#).unwrap();
        assert!(matches!(CoordinatorConfig::load(&path), Err(RagError::Config(_))));
    }

    #[test]
    fn session_needs_tokens_or_key() {
        let mut config = sample();
        assert!(config.build_session(&SessionOptions::default()).is_ok());
        config.nodes[0].bearer_token = None;
        assert!(matches!(
            config.build_session(&SessionOptions::default()),
            Err(RagError::Config(_))
        ));
        let options = SessionOptions {
            org_secret_key: Some("01".repeat(32)),
            ..SessionOptions::default()
        };
        assert!(config.build_session(&options).is_err());
        config.org_did = Some("did:nil:org".into());
        let session = config.build_session(&options).unwrap();
        assert_eq!(session.registry().len(), 2);
    }
}
