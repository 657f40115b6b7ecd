//! Image references and private registry credentials

use crate::config::RegistryConfig;
use crate::error::{BerthError, Result};
use bollard::auth::DockerCredentials;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info};

/// Lifetime of a generated token when the registry config sets none
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 12 * 60 * 60;

/// Append `:latest` unless the reference already carries a tag or digest
pub fn normalize_tag(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let (repository, tag) = split_tag(image);
    format!("{}:{}", repository, tag)
}

/// Split `repo[:tag]` into repository and tag, defaulting the tag to `latest`
///
/// Only a colon after the last `/` separates a tag, so registry ports
/// (`host:5000/app`) are kept in the repository.
pub fn split_tag(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Registry part of an image reference, if it has one
pub fn registry_domain(image: &str) -> Option<&str> {
    image.split_once('/').map(|(domain, _)| domain)
}

/// Short-lived registry credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryToken {
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl RegistryToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Engine credentials for pulls from `server`
    pub fn credentials(&self, server: &str) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            serveraddress: Some(server.to_string()),
            ..Default::default()
        }
    }
}

/// Issues credentials for a private registry
pub trait TokenProvider: Send + Sync + 'static {
    fn fetch_token(
        &self,
        registry: &RegistryConfig,
    ) -> impl Future<Output = Result<RegistryToken>> + Send;
}

/// Hands out the `username`/`password` pair written in the registry config
///
/// Access-key entries are refused: their secret is not a registry password
/// and must be exchanged for a token by a provider that speaks to the
/// registry's token service.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTokenProvider;

impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, registry: &RegistryConfig) -> Result<RegistryToken> {
        let (Some(username), Some(password)) = (&registry.username, &registry.password) else {
            let reason = if registry.access_key_id.is_some() || registry.secret_access_key.is_some()
            {
                "uses access keys, which need a token-exchanging provider"
            } else {
                "has no username and password"
            };
            return Err(BerthError::InvalidConfig(format!(
                "registry {} {}",
                registry.host, reason
            )));
        };
        let (username, password) = (username.clone(), password.clone());
        let ttl = registry.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        Ok(RegistryToken {
            username,
            password,
            expires_at: Utc::now() + Duration::seconds(ttl as i64),
        })
    }
}

/// Per-registry credential cache
pub struct RegistryAuth<T: TokenProvider> {
    registries: Vec<RegistryConfig>,
    provider: T,
    tokens: HashMap<String, RegistryToken>,
}

impl<T: TokenProvider> RegistryAuth<T> {
    pub fn new(registries: Vec<RegistryConfig>, provider: T) -> Self {
        Self {
            registries,
            provider,
            tokens: HashMap::new(),
        }
    }

    /// Configured registry serving `image`, matched by host or alias
    pub fn registry_for(&self, image: &str) -> Option<&RegistryConfig> {
        let domain = registry_domain(image)?;
        self.registries
            .iter()
            .find(|r| r.host == domain || r.alias.iter().any(|a| a == domain))
    }

    /// Cached token for a registry host
    pub fn cached(&self, host: &str) -> Option<&RegistryToken> {
        self.tokens.get(host)
    }

    /// Credentials for pulling `image`, fetching a token when the cached one
    /// is missing or expired; `None` for public images
    pub async fn credentials(&mut self, image: &str) -> Result<Option<DockerCredentials>> {
        let Some(registry) = self.registry_for(image).cloned() else {
            return Ok(None);
        };
        let fresh = self
            .tokens
            .get(&registry.host)
            .is_some_and(|token| !token.is_expired());
        if fresh {
            debug!("Using cached token for {}", registry.host);
        } else {
            let token = self.provider.fetch_token(&registry).await?;
            info!(
                "Fetched token for {}, valid until {}",
                registry.host, token.expires_at
            );
            self.tokens.insert(registry.host.clone(), token);
        }
        Ok(self
            .tokens
            .get(&registry.host)
            .map(|token| token.credentials(&registry.host)))
    }
}
