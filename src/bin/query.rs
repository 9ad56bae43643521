use anyhow::{Context, Result};
use clap::Parser;
use secretrag::{QueryOptions, RagCoordinator};

#[path = "shared/mod.rs"]
mod shared;

use shared::{init_tracing, ConnectionArgs, EmbedderArgs};

#[derive(Parser, Debug)]
#[command(
    name = "secretrag-query",
    about = "Retrieve the chunks nearest to a question without revealing stored embeddings"
)]
struct QueryCli {
    /// Question to search for.
    #[arg(long)]
    query: String,

    /// Number of chunks to return.
    #[arg(long, default_value_t = 2)]
    num_chunks: usize,

    /// Nearest clusters to search when clustering is configured (0 searches everything).
    #[arg(long, default_value_t = 1)]
    num_clusters: usize,

    /// Answer from the nodes that responded instead of failing on the first unavailable one.
    #[arg(long, default_value_t = false)]
    allow_degraded: bool,

    /// Print results as JSON instead of plain text.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = QueryCli::parse();
    let config = cli.connection.load_config()?;
    let options = QueryOptions {
        num_chunks: cli.num_chunks.max(1),
        num_clusters: cli.num_clusters,
        allow_degraded: cli.allow_degraded,
    };
    let coordinator = RagCoordinator::new(
        &config,
        &cli.connection.session_options(),
        cli.embedder.build()?,
        options,
    )?;
    let results = coordinator
        .top_chunks(&cli.query)
        .await
        .with_context(|| format!("query `{}` failed", cli.query))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    for (rank, result) in results.iter().enumerate() {
        println!(
            "#{} distance={:.6} id={}\n{}\n",
            rank + 1,
            result.distance,
            result.document_id,
            result.chunk
        );
    }
    Ok(())
}
