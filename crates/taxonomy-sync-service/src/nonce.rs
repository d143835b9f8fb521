use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub const FULL_SYNC_NONCE_TTL: Duration = Duration::hours(12);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IssuedNonce {
    pub nonce: String,
    pub expires_at: String,
}

/// Single-use tokens guarding the full-sync trigger.
#[derive(Debug)]
pub struct NonceRegistry {
    ttl: Duration,
    issued: Mutex<HashMap<String, OffsetDateTime>>,
}

impl NonceRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, issued: Mutex::new(HashMap::new()) }
    }

    /// # Errors
    /// Returns an error when the registry lock is poisoned or the expiry cannot be formatted.
    pub fn issue(&self) -> Result<IssuedNonce> {
        self.issue_at(OffsetDateTime::now_utc())
    }

    fn issue_at(&self, now: OffsetDateTime) -> Result<IssuedNonce> {
        let expires = now + self.ttl;
        let nonce = Ulid::new().to_string();
        let mut issued = self.issued.lock().map_err(|_| anyhow!("nonce registry lock poisoned"))?;
        issued.retain(|_, expiry| *expiry > now);
        issued.insert(nonce.clone(), expires);

        let expires_at = expires
            .format(&time::format_description::well_known::Rfc3339)
            .context("failed to format nonce expiry")?;
        Ok(IssuedNonce { nonce, expires_at })
    }

    /// Remove `nonce` and report whether it was issued and still live.
    ///
    /// # Errors
    /// Returns an error when the registry lock is poisoned.
    pub fn consume(&self, nonce: &str) -> Result<bool> {
        self.consume_at(nonce, OffsetDateTime::now_utc())
    }

    fn consume_at(&self, nonce: &str, now: OffsetDateTime) -> Result<bool> {
        let mut issued = self.issued.lock().map_err(|_| anyhow!("nonce registry lock poisoned"))?;
        Ok(issued.remove(nonce).is_some_and(|expiry| expiry > now))
    }
}

impl Default for NonceRegistry {
    fn default() -> Self {
        Self::new(FULL_SYNC_NONCE_TTL)
    }
}
