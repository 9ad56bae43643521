//! HTTP plumbing shared by every call the coordinator makes against a node.

use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{RagError, Result};
use crate::nodes::Node;

/// Timeout and retry budget for node calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeClientSettings {
    /// Wall-clock limit for one attempt.
    pub timeout: Duration,
    /// Attempts per call, including the first one.
    pub max_attempts: usize,
    /// Base delay; attempt `n` waits `n * retry_delay` before retrying.
    pub retry_delay: Duration,
}

impl Default for NodeClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Option<Vec<T>>,
}

/// Async JSON client for the node HTTP surface.
#[derive(Clone)]
pub struct NodeClient {
    http: Client,
    settings: NodeClientSettings,
}

impl NodeClient {
    /// Builds a client enforcing `settings.timeout` on every attempt.
    pub fn new(settings: NodeClientSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| RagError::Config(format!("failed to build node HTTP client: {err}")))?;
        Ok(Self {
            http,
            settings: NodeClientSettings {
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
        })
    }

    /// Settings in effect.
    pub fn settings(&self) -> NodeClientSettings {
        self.settings
    }

    /// POSTs `body` and returns the parsed JSON response (`Null` for an empty body).
    pub async fn post<B>(&self, node: &Node, token: &str, path: &str, body: &B) -> Result<serde_json::Value>
    where
        B: Serialize + ?Sized,
    {
        let bytes = self.send(node, token, path, body).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| RagError::Protocol {
            node: node.url.clone(),
            detail: format!("invalid JSON from {path}: {err}"),
        })
    }

    /// POSTs `body` and returns the `data` array of the response.
    pub async fn post_data<B, T>(&self, node: &Node, token: &str, path: &str, body: &B) -> Result<Vec<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.send(node, token, path, body).await?;
        let envelope: DataEnvelope<T> =
            serde_json::from_slice(&bytes).map_err(|err| RagError::Protocol {
                node: node.url.clone(),
                detail: format!("unexpected response from {path}: {err}"),
            })?;
        envelope.data.ok_or_else(|| RagError::Protocol {
            node: node.url.clone(),
            detail: format!("response from {path} is missing `data`"),
        })
    }

    async fn send<B>(&self, node: &Node, token: &str, path: &str, body: &B) -> Result<Vec<u8>>
    where
        B: Serialize + ?Sized,
    {
        let url = node.endpoint(path);
        let auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| RagError::Auth(format!("bearer token for {} is not a valid header", node.url)))?;
        let mut attempt = 0usize;
        loop {
            let response = self
                .http
                .post(&url)
                .header(AUTHORIZATION, auth.clone())
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .json(body)
                .send()
                .await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp
                            .text()
                            .await
                            .unwrap_or_else(|_| "<body unavailable>".to_string());
                        return Err(RagError::Protocol {
                            node: node.url.clone(),
                            detail: format!("POST {path} returned {status}: {text}"),
                        });
                    }
                    match resp.bytes().await {
                        Ok(bytes) => return Ok(bytes.to_vec()),
                        Err(err) => {
                            if self.should_retry(&err, attempt) {
                                attempt += 1;
                                self.backoff(node, path, attempt, &err).await;
                                continue;
                            }
                            return Err(RagError::Transport {
                                node: node.url.clone(),
                                source: err,
                            });
                        }
                    }
                }
                Err(err) => {
                    if self.should_retry(&err, attempt) {
                        attempt += 1;
                        self.backoff(node, path, attempt, &err).await;
                        continue;
                    }
                    return Err(RagError::Transport {
                        node: node.url.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    fn should_retry(&self, err: &reqwest::Error, attempt: usize) -> bool {
        let transient = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
        transient && attempt + 1 < self.settings.max_attempts
    }

    async fn backoff(&self, node: &Node, path: &str, attempt: usize, err: &reqwest::Error) {
        warn!(
            node = %node.url,
            path,
            attempt,
            error = %err,
            "node request failed; retrying"
        );
        sleep(self.settings.retry_delay * attempt as u32).await;
    }
}
