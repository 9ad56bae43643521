//! Short-lived bearer tokens for node requests.
//!
//! Tokens are ES256K JWTs (`{iss: org, aud: node did, exp}`) signed with the
//! organization's secp256k1 key. When no key is configured the provider falls back to
//! the static `bearer_token` carried by each node.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use serde::Serialize;

use crate::error::{RagError, Result};
use crate::nodes::{Node, NodeRegistry};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Tokens this close to expiry are re-signed.
const REFRESH_SKEW: Duration = Duration::from_secs(30);

struct OrgSigner {
    key: SigningKey,
    org_did: String,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: u64,
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    exp: u64,
}

/// Produces one bearer token per node.
pub struct TokenProvider {
    signer: Option<OrgSigner>,
    ttl: Duration,
    cache: Mutex<Vec<Option<CachedToken>>>,
}

impl TokenProvider {
    /// Signs tokens with the hex-encoded secp256k1 organization key.
    pub fn from_hex_key(secret_key: &str, org_did: &str, ttl: Duration) -> Result<Self> {
        let bytes = hex::decode(secret_key.trim())
            .map_err(|err| RagError::Auth(format!("organization key is not hex: {err}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|err| RagError::Auth(format!("invalid secp256k1 key: {err}")))?;
        if org_did.trim().is_empty() {
            return Err(RagError::Config("organization did is required".into()));
        }
        Ok(Self {
            signer: Some(OrgSigner {
                key,
                org_did: org_did.to_string(),
            }),
            ttl: ttl.max(REFRESH_SKEW * 2),
            cache: Mutex::new(Vec::new()),
        })
    }

    /// Uses each node's configured `bearer_token` as-is.
    pub fn static_tokens() -> Self {
        Self {
            signer: None,
            ttl: DEFAULT_TOKEN_TTL,
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Signs a fresh token for `audience`.
    pub fn sign(&self, audience: &str) -> Result<String> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| RagError::Config("no organization key configured".into()))?;
        let exp = unix_now() + self.ttl.as_secs();
        encode_jwt(&signer.key, &signer.org_did, audience, exp)
    }

    /// Token for the node at party index `index`, re-signed when close to expiry.
    pub fn token_for(&self, index: usize, node: &Node) -> Result<String> {
        let Some(signer) = &self.signer else {
            return node.bearer_token.clone().ok_or_else(|| {
                RagError::Config(format!(
                    "node {} has no bearer token and no organization key is configured",
                    node.url
                ))
            });
        };
        let now = unix_now();
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| RagError::Auth("token cache poisoned".into()))?;
        if cache.len() <= index {
            cache.resize(index + 1, None);
        }
        if let Some(cached) = &cache[index] {
            if cached.expires_at > now + REFRESH_SKEW.as_secs() {
                return Ok(cached.token.clone());
            }
        }
        let expires_at = now + self.ttl.as_secs();
        let token = encode_jwt(&signer.key, &signer.org_did, &node.did, expires_at)?;
        cache[index] = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    /// Issues (or reuses) a token for every node.
    pub fn issue_all(&self, registry: &NodeRegistry) -> Result<Vec<String>> {
        registry
            .iter()
            .enumerate()
            .map(|(index, node)| self.token_for(index, node))
            .collect()
    }
}

fn encode_jwt(key: &SigningKey, issuer: &str, audience: &str, exp: u64) -> Result<String> {
    let header = serde_json::to_vec(&JwtHeader {
        alg: "ES256K",
        typ: "JWT",
    })
    .map_err(|err| RagError::Auth(err.to_string()))?;
    let claims = serde_json::to_vec(&JwtClaims {
        iss: issuer,
        aud: audience,
        exp,
    })
    .map_err(|err| RagError::Auth(err.to_string()))?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    );
    let signature: Signature = key.sign(signing_input.as_bytes());
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
