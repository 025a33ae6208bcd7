//! TTL cache for authorization decisions
//!
//! Decisions are keyed by (identity, action, resource). An expired entry is
//! removed by the read that finds it, or by [`PolicyCache::cleanup_expired`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    identity_id: String,
    action: String,
    resource: String,
}

impl DecisionKey {
    fn new(identity_id: &str, action: &str, resource: &str) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// A cached authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub identity_id: String,
    pub action: String,
    pub resource: String,
    /// True if the action is allowed
    pub decision: bool,
    pub reason: String,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
}

struct CachedDecision {
    decision: PolicyDecision,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl CachedDecision {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map_or(self.decision.ttl, |at| at.saturating_duration_since(now))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyCacheStats {
    pub total_entries: usize,
    pub allowed: usize,
    pub denied: usize,
    pub unique_identities: usize,
    pub unique_resources: usize,
    /// Mean seconds left before expiry over live entries
    pub avg_ttl_remaining_secs: f64,
}

/// Decision cache with lazy expiry
pub struct PolicyCache {
    default_ttl: Duration,
    entries: Mutex<HashMap<DecisionKey, CachedDecision>>,
}

impl PolicyCache {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cache a decision for `ttl`, or the default TTL when `None`
    pub fn cache_decision(
        &self,
        identity_id: &str,
        action: &str,
        resource: &str,
        decision: bool,
        reason: &str,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CachedDecision {
            decision: PolicyDecision {
                identity_id: identity_id.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
                decision,
                reason: reason.to_string(),
                cached_at: Utc::now(),
                ttl,
            },
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries
            .lock()
            .insert(DecisionKey::new(identity_id, action, resource), entry);
    }

    /// Look up a live decision; an expired one is removed and reported absent
    #[must_use]
    pub fn get_decision(&self, identity_id: &str, action: &str, resource: &str) -> Option<PolicyDecision> {
        let key = DecisionKey::new(identity_id, action, resource);
        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if entry.is_expired(Instant::now()) {
            entries.remove(&key);
            debug!("Expired policy decision {identity_id}:{action}:{resource}");
            return None;
        }
        Some(entry.decision.clone())
    }

    /// Sweep expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn clear_for_identity(&self, identity_id: &str) {
        self.entries
            .lock()
            .retain(|key, _| key.identity_id != identity_id);
    }

    pub fn clear_for_resource(&self, resource: &str) {
        self.entries.lock().retain(|key, _| key.resource != resource);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Statistics over live entries; expired ones are swept first
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> PolicyCacheStats {
        self.cleanup_expired();

        let now = Instant::now();
        let entries = self.entries.lock();
        let mut allowed = 0;
        let mut identities = HashSet::new();
        let mut resources = HashSet::new();
        let mut remaining = 0.0;
        for (key, entry) in entries.iter() {
            if entry.decision.decision {
                allowed += 1;
            }
            identities.insert(key.identity_id.as_str());
            resources.insert(key.resource.as_str());
            remaining += entry.remaining(now).as_secs_f64();
        }
        let total_entries = entries.len();

        PolicyCacheStats {
            total_entries,
            allowed,
            denied: total_entries - allowed,
            unique_identities: identities.len(),
            unique_resources: resources.len(),
            avg_ttl_remaining_secs: if total_entries == 0 {
                0.0
            } else {
                remaining / total_entries as f64
            },
        }
    }
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
