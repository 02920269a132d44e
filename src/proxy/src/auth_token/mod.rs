pub mod rds;

use crate::config::Profile;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to load credentials for region {region:?} (profile {profile:?}): {source}")]
    LoadCredentials {
        region: String,
        profile: Option<String>,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to build auth token for {endpoint}: {source}")]
    BuildToken {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A minted backend auth token and the moment this cache stops trusting it.
/// Never mutated; refreshes replace the entry wholesale.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Loads a credentials handle for (region, optional named credential
/// profile). Loaded once per key for the process lifetime.
#[async_trait]
pub trait ProviderLoader<P>: Send + Sync {
    async fn load(&self, region: &str, credential_profile: Option<&str>) -> anyhow::Result<P>;
}

/// Mints one opaque token for a backend endpoint using a loaded credentials
/// handle.
#[async_trait]
pub trait TokenBuilder<P>: Send + Sync {
    async fn build(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
        provider: &P,
    ) -> anyhow::Result<String>;
}

/// Generic-free view of the cache for the backend factory.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, profile: &Profile) -> Result<CachedToken, TokenError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    profile: String,
    host: String,
    port: u16,
    region: String,
    db_user: String,
    credential_profile: Option<String>,
}

impl TokenKey {
    fn for_profile(profile: &Profile) -> Self {
        Self {
            profile: profile.name.clone(),
            host: profile.backend_host.clone(),
            port: profile.backend_port,
            region: profile.region.clone(),
            db_user: profile.db_user.clone(),
            credential_profile: profile.credential_profile.clone(),
        }
    }
}

type ProviderKey = (String, Option<String>);

#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    /// entries with less than this much lifetime left are re-minted
    pub refresh_before: Duration,
    /// lifetime stamped onto freshly minted entries
    pub token_ttl: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            refresh_before: Duration::from_secs(2 * 60),
            token_ttl: Duration::from_secs(10 * 60),
        }
    }
}

struct CacheState<P> {
    tokens: HashMap<TokenKey, CachedToken>,
    providers: HashMap<ProviderKey, P>,
}

/// Process-wide token cache shared by every proxy instance. One mutex guards
/// both maps; it is never held across an SDK call, so concurrent minters for
/// the same key may each mint independently and the last writer wins. Tokens
/// are idempotent bearer credentials, which makes that race harmless.
pub struct TokenCache<P> {
    state: Mutex<CacheState<P>>,
    loader: Arc<dyn ProviderLoader<P>>,
    builder: Arc<dyn TokenBuilder<P>>,
    config: TokenCacheConfig,
}

impl<P: Clone + Send + Sync + 'static> TokenCache<P> {
    pub fn new(
        loader: Arc<dyn ProviderLoader<P>>,
        builder: Arc<dyn TokenBuilder<P>>,
        config: TokenCacheConfig,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState {
                tokens: HashMap::new(),
                providers: HashMap::new(),
            }),
            loader,
            builder,
            config,
        }
    }

    pub async fn get(&self, profile: &Profile) -> Result<CachedToken, TokenError> {
        let key = TokenKey::for_profile(profile);
        let refresh_before = chrono::Duration::from_std(self.config.refresh_before)
            .unwrap_or(chrono::Duration::MAX);
        {
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.tokens.get(&key) {
                if entry.expires_at - Utc::now() > refresh_before {
                    return Ok(entry.clone());
                }
            }
        }
        self.mint(profile, key).await
    }

    async fn mint(&self, profile: &Profile, key: TokenKey) -> Result<CachedToken, TokenError> {
        let provider = self.provider_for(profile).await?;
        let endpoint = profile.backend_endpoint();
        let token = self
            .builder
            .build(&endpoint, &profile.region, &profile.db_user, &provider)
            .await
            .map_err(|source| TokenError::BuildToken {
                endpoint: endpoint.clone(),
                source,
            })?;
        let minted = CachedToken {
            token,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.config.token_ttl)
                    .unwrap_or(chrono::Duration::MAX),
        };
        debug!(endpoint = %endpoint, expires_at = %minted.expires_at, "minted backend auth token");
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(key, minted.clone());
        Ok(minted)
    }

    async fn provider_for(&self, profile: &Profile) -> Result<P, TokenError> {
        let key: ProviderKey = (profile.region.clone(), profile.credential_profile.clone());
        if let Some(provider) = self.state.lock().unwrap().providers.get(&key) {
            return Ok(provider.clone());
        }
        let loaded = self
            .loader
            .load(&profile.region, profile.credential_profile.as_deref())
            .await
            .map_err(|source| TokenError::LoadCredentials {
                region: profile.region.clone(),
                profile: profile.credential_profile.clone(),
                source,
            })?;
        // a concurrent loader may have won the race; keep whichever landed first
        let mut state = self.state.lock().unwrap();
        Ok(state.providers.entry(key).or_insert(loaded).clone())
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> TokenSource for TokenCache<P> {
    async fn token(&self, profile: &Profile) -> Result<CachedToken, TokenError> {
        self.get(profile).await
    }
}
