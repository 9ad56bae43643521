#![warn(missing_docs)]
//! Retrieval-augmented generation over secret-shared embeddings.
//!
//! Documents are split into additive shares held by N independent storage nodes. The
//! coordinator uploads shares, asks every node to subtract its share of a query
//! embedding from its share of each stored embedding, and reconstructs only the
//! resulting distances and the winning chunks.

pub mod aggregate;
pub mod auth;
pub mod chunking;
pub mod client;
pub mod clusters;
pub mod config;
pub mod coordinator;
pub mod embedder;
pub mod error;
pub mod fixed_point;
pub mod init;
pub mod nodes;
pub mod query;
pub mod records;
pub mod session;
pub mod shares;
pub mod write;

pub use auth::TokenProvider;
pub use client::{NodeClient, NodeClientSettings};
pub use clusters::{kmeans, ClusterLocator, ClusterModel, NearestClusters};
pub use config::{CoordinatorConfig, SessionOptions};
pub use coordinator::RagCoordinator;
pub use embedder::{Embedder, HashingEmbedder, OpenAiEmbedder};
pub use error::{RagError, Result};
pub use init::{Initializer, SetupIds};
pub use nodes::{Identifier, Node, NodeRegistry};
pub use query::{QueryCoordinator, QueryOptions, RetrievedChunk};
pub use session::Session;
pub use shares::{AdditiveSharing, SecretSharer, Share, ShareBundle, ShareKind, PRIME_MODULUS};
pub use write::{ClusterAssignment, WritePipeline, WriteSummary};
