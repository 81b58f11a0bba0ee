//! Single-use nonces on the shared counter store.
//!
//! Authentication challenges hand out nonces that must be accepted at most
//! once. Keeping them in the counter store gives them the same expiry and
//! multi-instance behavior as rate limit counters.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::store::{CounterStore, StoreError, StoreResult};

/// Tracks which nonces have been used.
pub struct NonceRegistry {
    store: Arc<dyn CounterStore>,
    prefix: String,
    timeout: Duration,
}

impl NonceRegistry {
    /// Every store operation gives up after `timeout`.
    pub fn new(store: Arc<dyn CounterStore>, prefix: &str, timeout: Duration) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            timeout,
        }
    }

    fn key(&self, nonce: &str) -> String {
        format!("{}:nonce:{}", self.prefix, hex::encode(Sha256::digest(nonce.as_bytes())))
    }

    async fn bounded<T>(&self, operation: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!("timed out after {:?}", self.timeout)))
            })
    }

    /// Claim `nonce` for `ttl`. Returns `true` only for the first claim.
    ///
    /// Store failures and timeouts are returned as errors: a nonce is never
    /// accepted without the store's confirmation.
    pub async fn claim(&self, nonce: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(nonce);
        let uses = self.bounded(self.store.increment_with_expiry(&key, ttl)).await?;
        let fresh = uses == 1;
        if !fresh {
            debug!(uses = uses, "Nonce replay rejected");
        }
        Ok(fresh)
    }

    /// Whether `nonce` has been claimed or burned and not yet expired.
    pub async fn is_claimed(&self, nonce: &str) -> Result<bool> {
        let key = self.key(nonce);
        Ok(self.bounded(self.store.get(&key)).await?.is_some_and(|uses| uses > 0))
    }

    /// Mark `nonce` as used without claiming it, e.g. when a challenge is revoked.
    pub async fn burn(&self, nonce: &str, ttl: Duration) -> Result<()> {
        let key = self.key(nonce);
        self.bounded(self.store.set(&key, 1, ttl)).await?;
        Ok(())
    }
}
