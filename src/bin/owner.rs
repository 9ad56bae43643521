use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secretrag::chunking::{create_chunks, load_paragraphs, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP};
use secretrag::{HashingEmbedder, QueryOptions, RagCoordinator};
use tracing::info;

#[path = "shared/mod.rs"]
mod shared;

use shared::{init_tracing, ConnectionArgs, EmbedderArgs};

#[derive(Parser, Debug)]
#[command(
    name = "secretrag-owner",
    about = "Data-owner tool: prepare nodes, upload secret-shared documents, flush them"
)]
struct OwnerCli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create schemas and subtract queries on every node and save their ids to the config.
    Init {
        /// Also create the centroid schema and the cluster-filtered query.
        #[arg(long, default_value_t = false)]
        with_clustering: bool,
    },
    /// Chunk, embed, share and upload a text file.
    Write {
        /// Plain-text file; paragraphs are separated by blank lines.
        #[arg(long)]
        file: PathBuf,

        /// Words per chunk.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Words shared by consecutive chunks.
        #[arg(long, default_value_t = DEFAULT_OVERLAP)]
        overlap: usize,

        /// Run k-means with this many clusters before upload (0 or 1 disables).
        #[arg(long, default_value_t = 0)]
        clusters: usize,

        #[command(flatten)]
        embedder: EmbedderArgs,
    },
    /// Delete every uploaded document (and centroid) from every node.
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = OwnerCli::parse();
    let mut config = cli.connection.load_config()?;
    let options = cli.connection.session_options();

    match cli.command {
        Command::Init { with_clustering } => {
            config.with_clustering |= with_clustering;
            let embedder = Arc::new(HashingEmbedder::default());
            let mut coordinator =
                RagCoordinator::new(&config, &options, embedder, QueryOptions::default())?;
            let ids = coordinator
                .initialize()
                .await
                .context("node initialization failed")?;
            config.absorb(coordinator.registry());
            config
                .save(&cli.connection.config)
                .with_context(|| format!("failed to save {}", cli.connection.config.display()))?;
            println!("schema_id={}", ids.schema_id);
            println!("subtract_query_id={}", ids.subtract_query_id);
            if let Some(id) = &ids.clusters_schema_id {
                println!("clusters_schema_id={id}");
            }
            if let Some(id) = &ids.cluster_subtract_query_id {
                println!("cluster_subtract_query_id={id}");
            }
        }
        Command::Write {
            file,
            chunk_size,
            overlap,
            clusters,
            embedder,
        } => {
            let paragraphs = load_paragraphs(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let chunks = create_chunks(&paragraphs, chunk_size, overlap)?;
            if chunks.is_empty() {
                bail!("{} contains no text to upload", file.display());
            }
            info!(
                paragraphs = paragraphs.len(),
                chunks = chunks.len(),
                "prepared chunks"
            );
            let coordinator = RagCoordinator::new(
                &config,
                &options,
                embedder.build()?,
                QueryOptions::default(),
            )?;
            let summary = coordinator
                .upload_chunks(&chunks, clusters)
                .await
                .context("upload failed")?;
            println!(
                "uploaded {} documents in {} batches ({} centroids)",
                summary.document_ids.len(),
                summary.batches,
                summary.centroid_ids.len()
            );
        }
        Command::Flush => {
            let embedder = Arc::new(HashingEmbedder::default());
            let coordinator =
                RagCoordinator::new(&config, &options, embedder, QueryOptions::default())?;
            coordinator.flush().await.context("flush failed")?;
            println!("flushed all uploaded documents");
        }
    }
    Ok(())
}
