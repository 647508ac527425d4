// OAuth `state` tokens for the authorization-code bootstrap

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::types::System;

/// Longest lifetime a pending authorization may have
pub const MAX_STATE_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct PendingAuthorization {
    system: System,
    created_at: DateTime<Utc>,
}

/// Single-use CSRF state tokens, each bound to the system that issued it
#[derive(Clone)]
pub struct OAuthStateStore {
    pending: Arc<DashMap<String, PendingAuthorization>>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_secs.min(MAX_STATE_TTL_SECS) as i64),
        }
    }

    /// Issue a new state token for `system`
    pub fn issue(&self, system: System) -> String {
        self.prune_expired();

        let state = Uuid::new_v4().to_string();
        self.pending.insert(
            state.clone(),
            PendingAuthorization {
                system,
                created_at: Utc::now(),
            },
        );
        state
    }

    /// Consume a state token; true only if it was issued for `system` and
    /// has not expired. A token is removed even when the check fails.
    pub fn consume(&self, state: &str, system: System) -> bool {
        let Some((_, entry)) = self.pending.remove(state) else {
            return false;
        };

        if Utc::now() - entry.created_at > self.ttl {
            tracing::warn!("Rejected expired OAuth state for {}", system);
            return false;
        }

        if entry.system != system {
            tracing::warn!(
                "Rejected OAuth state issued for {} on {} callback",
                entry.system,
                system
            );
            return false;
        }

        true
    }

    pub fn prune_expired(&self) {
        let now = Utc::now();
        self.pending
            .retain(|_, entry| now - entry.created_at <= self.ttl);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
