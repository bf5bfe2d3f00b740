//! One-time log subscription tokens.

use crate::error::FleetError;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an issued token stays redeemable.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct LogToken {
    instance_id: String,
    issued_at: Instant,
}

/// Mints and redeems short-lived, single-use log tokens.
///
/// Redeeming removes the token from the table, so a value can only ever be
/// accepted once even under concurrent redemption.
#[derive(Debug)]
pub struct TokenIssuer {
    tokens: DashMap<String, LogToken>,
    ttl: Duration,
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issues a new token authorizing one attach to `instance_id`.
    pub fn issue(&self, instance_id: &str) -> String {
        let value = Uuid::new_v4().simple().to_string();
        self.tokens.insert(
            value.clone(),
            LogToken {
                instance_id: instance_id.to_string(),
                issued_at: Instant::now(),
            },
        );
        info!(instance = %instance_id, "🔑 Issued log token");
        value
    }

    /// Consumes `token` and returns the instance it was issued for.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidOrExpiredToken`] if the token is unknown, already
    /// redeemed, or older than the TTL.
    pub fn redeem(&self, token: &str) -> Result<String, FleetError> {
        let (_, entry) = self
            .tokens
            .remove(token)
            .ok_or(FleetError::InvalidOrExpiredToken)?;

        if entry.issued_at.elapsed() > self.ttl {
            warn!(instance = %entry.instance_id, "Rejected expired log token");
            return Err(FleetError::InvalidOrExpiredToken);
        }

        debug!(instance = %entry.instance_id, "Redeemed log token");
        Ok(entry.instance_id)
    }

    /// Drops every token past its TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.tokens.len();
        self.tokens
            .retain(|_, token| token.issued_at.elapsed() <= self.ttl);
        let purged = before.saturating_sub(self.tokens.len());
        if purged > 0 {
            debug!(purged, "Purged expired log tokens");
        }
        purged
    }

    /// Drops every outstanding token for `instance_id`. Returns how many.
    pub fn revoke_instance(&self, instance_id: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.instance_id != instance_id);
        before.saturating_sub(self.tokens.len())
    }

    /// Number of outstanding tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
