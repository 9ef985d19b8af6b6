//! Pool of interchangeable model API keys.
//!
//! Calls rotate round-robin across keys. A key that gets rate limited is
//! skipped for `cooldown` so one throttled key does not burn a turn's retry
//! budget while others are healthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Credential {
    pub index: usize,
    key: String,
}

impl Credential {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("key", &"<redacted>")
            .finish()
    }
}

pub struct CredentialPool {
    credentials: Vec<Credential>,
    next: AtomicUsize,
    cooldown: Duration,
    /// Credentials in cooldown, with the time they were limited.
    rate_limited: Arc<RwLock<HashMap<usize, Instant>>>,
}

impl CredentialPool {
    /// Blank keys are ignored.
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        let credentials = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(index, key)| Credential { index, key })
            .collect();
        Self {
            credentials,
            next: AtomicUsize::new(0),
            cooldown,
            rate_limited: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Order in which to try credentials for one call: round-robin from the
    /// shared cursor, credentials in cooldown left out. Expired cooldowns are
    /// dropped first.
    pub async fn rotation(&self) -> Vec<Credential> {
        let n = self.credentials.len();
        if n == 0 {
            return Vec::new();
        }
        self.expire_cooldowns().await;
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let limited = self.rate_limited.read().await;
        (0..n)
            .map(|i| &self.credentials[(start + i) % n])
            .filter(|c| !limited.contains_key(&c.index))
            .cloned()
            .collect()
    }

    pub async fn record_rate_limit(&self, credential: &Credential) {
        self.rate_limited
            .write()
            .await
            .insert(credential.index, Instant::now());
        warn!(
            credential = credential.index,
            cooldown_secs = self.cooldown.as_secs(),
            "Credential rate limited, entering cooldown"
        );
    }

    /// Number of credentials currently in cooldown.
    pub async fn cooling_down(&self) -> usize {
        self.expire_cooldowns().await;
        self.rate_limited.read().await.len()
    }

    async fn expire_cooldowns(&self) {
        let cooldown = self.cooldown;
        let mut limited = self.rate_limited.write().await;
        let before = limited.len();
        limited.retain(|_, limited_at| limited_at.elapsed() < cooldown);
        if limited.len() < before {
            debug!(
                restored = before - limited.len(),
                "Credential cooldown expired"
            );
        }
    }
}
