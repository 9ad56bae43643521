//! Per-process connection state: the node registry, tokens, HTTP client and share primitive.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::warn;

use crate::auth::TokenProvider;
use crate::client::NodeClient;
use crate::error::{RagError, Result};
use crate::nodes::{Node, NodeRegistry};
use crate::shares::SecretSharer;

/// Everything a pipeline needs to talk to the nodes.
pub struct Session {
    registry: NodeRegistry,
    tokens: TokenProvider,
    client: NodeClient,
    sharer: Arc<dyn SecretSharer>,
}

impl Session {
    /// Binds the pieces together; the share primitive must span exactly the registry.
    pub fn new(
        registry: NodeRegistry,
        tokens: TokenProvider,
        client: NodeClient,
        sharer: Arc<dyn SecretSharer>,
    ) -> Result<Self> {
        if sharer.parties() != registry.len() {
            return Err(RagError::Config(format!(
                "share primitive spans {} parties but {} nodes are configured",
                sharer.parties(),
                registry.len()
            )));
        }
        Ok(Self {
            registry,
            tokens,
            client,
            sharer,
        })
    }

    /// Node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Mutable registry, used only to record generated identifiers.
    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    /// Share primitive.
    pub fn sharer(&self) -> &dyn SecretSharer {
        self.sharer.as_ref()
    }

    /// HTTP client.
    pub fn client(&self) -> &NodeClient {
        &self.client
    }

    /// Token for the node at `index`.
    pub fn token(&self, index: usize) -> Result<String> {
        let node = self
            .registry
            .get(index)
            .ok_or_else(|| RagError::Config(format!("no node at index {index}")))?;
        self.tokens.token_for(index, node)
    }

    /// Runs `call` once per node concurrently and waits for all of them.
    ///
    /// Results come back in party order regardless of completion order.
    pub async fn fan_out<'a, F, Fut, T>(&'a self, call: F) -> Vec<Result<T>>
    where
        F: Fn(usize, &'a Node, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tasks = self.registry.iter().enumerate().map(|(index, node)| {
            let pending = self
                .tokens
                .token_for(index, node)
                .map(|token| call(index, node, token));
            async move {
                match pending {
                    Ok(fut) => fut.await,
                    Err(err) => Err(err),
                }
            }
        });
        join_all(tasks).await
    }

    /// POSTs `bodies[i]` to node `i`; every node must accept it.
    pub async fn post_all<B>(&self, path: &str, bodies: &[B]) -> Result<()>
    where
        B: Serialize,
    {
        if bodies.len() != self.registry.len() {
            return Err(RagError::Input(format!(
                "{} request bodies for {} nodes",
                bodies.len(),
                self.registry.len()
            )));
        }
        let client = &self.client;
        let results = self
            .fan_out(|index, node, token| {
                let body = &bodies[index];
                async move { client.post(node, &token, path, body).await }
            })
            .await;
        require_all(results).map(|_| ())
    }
}

/// Collapses per-node results, failing if any node failed.
pub fn require_all<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => {
                warn!(error = %err, "node call failed");
                errors.push(err);
            }
        }
    }
    match errors.len() {
        0 => Ok(values),
        1 => Err(errors.remove(0)),
        _ => Err(RagError::NodeUnavailable {
            nodes: errors
                .iter()
                .map(|err| err.node().unwrap_or("<unknown>").to_string())
                .collect(),
        }),
    }
}
