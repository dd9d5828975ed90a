//! Platform key sets, fetched from each registration's key set URL and
//! cached for the configured TTL.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use moka::sync::Cache;
use tracing::{debug, warn};

use crate::error::LaunchError;

const MAX_KEY_SETS: u64 = 10_000;
const MAX_MISSES: u64 = 10_000;
/// How long a kid missing from a freshly fetched set is not looked up again.
const MISS_TTL: Duration = Duration::from_secs(60);

pub struct KeySetCache {
    client: reqwest::Client,
    sets: Cache<String, Arc<JwkSet>>,
    /// `{url}#{kid}` for kids the platform's current set doesn't have.
    missed: Cache<String, ()>,
}

impl KeySetCache {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        let sets = Cache::builder()
            .max_capacity(MAX_KEY_SETS)
            .time_to_live(ttl)
            .build();
        let missed = Cache::builder()
            .max_capacity(MAX_MISSES)
            .time_to_live(MISS_TTL)
            .build();
        KeySetCache {
            client,
            sets,
            missed,
        }
    }

    async fn fetch(&self, url: &str) -> Result<Arc<JwkSet>, LaunchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LaunchError::KeySetUnavailable(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "key set fetch failed");
            return Err(LaunchError::KeySetUnavailable(format!(
                "{url} returned {status}"
            )));
        }
        let set: JwkSet = resp
            .json()
            .await
            .map_err(|e| LaunchError::KeySetUnavailable(format!("{url}: {e}")))?;
        debug!(url, keys = set.keys.len(), "fetched key set");
        let set = Arc::new(set);
        self.sets.insert(url.to_string(), set.clone());
        Ok(set)
    }

    /// The decoding key `kid` from the key set at `url`.
    ///
    /// A cached set without the key is refetched once, so platforms can
    /// rotate keys without waiting for the TTL. A kid still missing after
    /// that is not refetched for a minute.
    pub async fn decoding_key(&self, url: &str, kid: &str) -> Result<DecodingKey, LaunchError> {
        let miss_key = format!("{url}#{kid}");
        let set = match self.sets.get(url) {
            Some(cached) if cached.find(kid).is_some() => cached,
            Some(_) if self.missed.contains_key(&miss_key) => {
                return Err(LaunchError::KeyNotFound(kid.to_string()));
            }
            Some(_) => {
                debug!(url, kid, "key not in cached set, refetching");
                self.fetch(url).await?
            }
            None => self.fetch(url).await?,
        };
        let Some(jwk) = set.find(kid) else {
            self.missed.insert(miss_key, ());
            return Err(LaunchError::KeyNotFound(kid.to_string()));
        };
        DecodingKey::from_jwk(jwk).map_err(|e| LaunchError::KeyNotFound(format!("{kid}: {e}")))
    }
}
