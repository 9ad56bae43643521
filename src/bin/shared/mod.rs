//! Flags and setup shared by the secretrag operator tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use secretrag::{
    CoordinatorConfig, Embedder, HashingEmbedder, NodeClientSettings, OpenAiEmbedder,
    SessionOptions,
};
use tracing_subscriber::EnvFilter;

/// Where the node list lives and how to authenticate against it.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Coordinator config (JSON node list plus generated identifiers).
    #[arg(long, env = "SECRETRAG_CONFIG", default_value = "secretrag.json")]
    pub config: PathBuf,

    /// Hex-encoded secp256k1 organization key used to sign node tokens.
    #[arg(long, env = "SECRETRAG_ORG_SECRET_KEY", hide_env_values = true)]
    pub org_secret_key: Option<String>,

    /// Organization DID; overrides `org_did` from the config file.
    #[arg(long, env = "SECRETRAG_ORG_DID")]
    pub org_did: Option<String>,

    /// Seconds before a node request attempt times out.
    #[arg(long, env = "SECRETRAG_NODE_TIMEOUT_SECS", default_value_t = 30)]
    pub node_timeout_secs: u64,

    /// Attempts per node request, including the first.
    #[arg(long, env = "SECRETRAG_NODE_MAX_ATTEMPTS", default_value_t = 3)]
    pub node_max_attempts: usize,

    /// Base delay between attempts in milliseconds; grows linearly.
    #[arg(long, default_value_t = 1000)]
    pub node_retry_delay_ms: u64,
}

impl ConnectionArgs {
    /// Loads the config and applies command-line overrides.
    pub fn load_config(&self) -> Result<CoordinatorConfig> {
        let mut config = CoordinatorConfig::load(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        if let Some(did) = &self.org_did {
            config.org_did = Some(did.clone());
        }
        Ok(config)
    }

    /// Secrets and transport settings for the session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            org_secret_key: self.org_secret_key.clone(),
            client: NodeClientSettings {
                timeout: Duration::from_secs(self.node_timeout_secs.max(1)),
                max_attempts: self.node_max_attempts.max(1),
                retry_delay: Duration::from_millis(self.node_retry_delay_ms),
            },
            ..SessionOptions::default()
        }
    }
}

/// Which model turns text into vectors.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Embedding backend (openai or hashing).
    #[arg(long, env = "SECRETRAG_EMBEDDER", default_value = "openai")]
    pub embedder: String,

    /// API key for OpenAI-compatible endpoints.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Embedding model identifier.
    #[arg(
        long,
        env = "SECRETRAG_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    pub openai_model: String,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "SECRETRAG_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    pub openai_base_url: String,

    /// Embedding dimensions; also the width of the hashing embedder.
    #[arg(long, env = "SECRETRAG_EMBEDDING_DIMENSIONS", default_value_t = 384)]
    pub dimensions: usize,

    /// Seconds before embedding requests time out.
    #[arg(long, default_value_t = 30)]
    pub openai_timeout_secs: u64,

    /// Retry attempts for transient embedding errors.
    #[arg(long, default_value_t = 5)]
    pub openai_max_retries: usize,
}

impl EmbedderArgs {
    /// Builds the selected backend.
    pub fn build(&self) -> Result<Arc<dyn Embedder>> {
        match self.embedder.to_ascii_lowercase().as_str() {
            "hashing" => Ok(Arc::new(HashingEmbedder::new(self.dimensions))),
            "openai" => {
                let Some(key) = self.openai_api_key.as_deref() else {
                    bail!("--openai-api-key (or OPENAI_API_KEY) is required for the openai embedder");
                };
                let embedder = OpenAiEmbedder::new(
                    key,
                    &self.openai_base_url,
                    &self.openai_model,
                    Some(self.dimensions),
                    Duration::from_secs(self.openai_timeout_secs.max(1)),
                    self.openai_max_retries.max(1),
                )?;
                Ok(Arc::new(embedder))
            }
            other => bail!("unknown embedder `{other}` (expected openai or hashing)"),
        }
    }
}

/// Installs the fmt subscriber, honouring `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
