//! Two-tier decision cache
//!
//! Tier 1 is a small in-process LRU with a short TTL, sized to absorb
//! request bursts. Tier 2 is a pluggable shared cache with a longer TTL;
//! the in-memory implementation stands in where no distributed backend is
//! deployed. Keys fingerprint the request identity only, so two requests
//! differing in context attributes share a cached decision.

use async_trait::async_trait;
use blake3::Hasher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::Result;
use crate::types::Decision;

/// Cache key type (BLAKE3 hash of the request identity)
pub type CacheKey = [u8; 32];

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of tier-1 entries
    pub l1_capacity: usize,

    /// Tier-1 time-to-live
    pub l1_ttl: Duration,

    /// Tier-2 time-to-live
    pub l2_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl: Duration::from_secs(10),
            l2_ttl: Duration::from_secs(300),
        }
    }
}

/// Compute the cache key for a request.
///
/// Context and attributes are deliberately excluded: the fingerprint covers
/// who asks for what, not the circumstances of the ask.
pub fn compute_key(
    organization_id: &str,
    principal_id: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
) -> CacheKey {
    let mut hasher = Hasher::new();
    hasher.update(organization_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(principal_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(action.as_bytes());
    hasher.update(&[0]);
    hasher.update(resource_type.as_bytes());
    hasher.update(&[0]);
    hasher.update(resource_id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// A decision stored in the shared tier, tagged for invalidation
#[derive(Debug, Clone)]
pub struct CachedDecision {
    pub decision: Decision,
    pub organization_id: String,
    pub principal_id: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedDecision {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Shared (tier-2) decision cache backend
#[async_trait]
pub trait SharedDecisionCache: Send + Sync {
    /// Fetch a cached decision
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedDecision>>;

    /// Store a decision
    async fn put(&self, key: CacheKey, entry: CachedDecision) -> Result<()>;

    /// Drop all decisions for one principal in an organization
    async fn remove_principal(&self, organization_id: &str, principal_id: &str) -> Result<()>;

    /// Drop all decisions for an organization
    async fn remove_organization(&self, organization_id: &str) -> Result<()>;

    /// Drop everything
    async fn clear(&self) -> Result<()>;
}

/// In-process tier-2 implementation
pub struct InMemorySharedCache {
    entries: DashMap<CacheKey, CachedDecision>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedDecisionCache for InMemorySharedCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedDecision>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(Utc::now()) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: CacheKey, entry: CachedDecision) -> Result<()> {
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn remove_principal(&self, organization_id: &str, principal_id: &str) -> Result<()> {
        self.entries.retain(|_, entry| {
            !(entry.organization_id == organization_id && entry.principal_id == principal_id)
        });
        Ok(())
    }

    async fn remove_organization(&self, organization_id: &str) -> Result<()> {
        self.entries
            .retain(|_, entry| entry.organization_id != organization_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Tier-1 entry, tagged for invalidation
struct L1Entry {
    decision: Decision,
    organization_id: String,
    principal_id: String,
    expires_at: Instant,
}

/// Two-tier decision cache
pub struct DecisionCache {
    l1: Mutex<LruCache<CacheKey, L1Entry>>,
    shared: Arc<dyn SharedDecisionCache>,
    config: CacheConfig,
    requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l1_evictions: AtomicU64,
}

impl DecisionCache {
    /// Create a cache with the in-process shared tier
    pub fn new(config: CacheConfig) -> Self {
        Self::with_shared(config, Arc::new(InMemorySharedCache::new()))
    }

    /// Create a cache backed by a custom shared tier
    pub fn with_shared(config: CacheConfig, shared: Arc<dyn SharedDecisionCache>) -> Self {
        let capacity =
            NonZeroUsize::new(config.l1_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            shared,
            config,
            requests: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l1_evictions: AtomicU64::new(0),
        }
    }

    /// Look up a decision. A tier-2 hit is promoted into tier 1.
    pub async fn get(&self, key: &CacheKey) -> Option<Decision> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        {
            let mut l1 = self.l1.lock();
            if let Some(entry) = l1.get(key) {
                if entry.expires_at > Instant::now() {
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.decision.clone());
                }
                l1.pop(key);
            }
        }

        match self.shared.get(key).await {
            Ok(Some(cached)) if !cached.is_expired(Utc::now()) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.insert_l1(
                    *key,
                    cached.decision.clone(),
                    &cached.organization_id,
                    &cached.principal_id,
                );
                Some(cached.decision)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "shared cache read failed");
                None
            }
        }
    }

    /// Write a decision through both tiers
    pub async fn put(
        &self,
        key: CacheKey,
        organization_id: &str,
        principal_id: &str,
        decision: Decision,
    ) {
        self.insert_l1(key, decision.clone(), organization_id, principal_id);

        let ttl = chrono::Duration::from_std(self.config.l2_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let entry = CachedDecision {
            decision,
            organization_id: organization_id.to_string(),
            principal_id: principal_id.to_string(),
            expires_at: Utc::now() + ttl,
        };
        if let Err(e) = self.shared.put(key, entry).await {
            warn!(error = %e, "shared cache write failed");
        }
    }

    /// Drop all cached decisions for one principal, both tiers
    pub async fn invalidate_principal(&self, organization_id: &str, principal_id: &str) {
        {
            let mut l1 = self.l1.lock();
            let keys: Vec<CacheKey> = l1
                .iter()
                .filter(|(_, entry)| {
                    entry.organization_id == organization_id
                        && entry.principal_id == principal_id
                })
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                l1.pop(&key);
            }
        }

        if let Err(e) = self.shared.remove_principal(organization_id, principal_id).await {
            warn!(error = %e, "shared cache principal invalidation failed");
        }
    }

    /// Drop all cached decisions for an organization, both tiers
    pub async fn invalidate_organization(&self, organization_id: &str) {
        {
            let mut l1 = self.l1.lock();
            let keys: Vec<CacheKey> = l1
                .iter()
                .filter(|(_, entry)| entry.organization_id == organization_id)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                l1.pop(&key);
            }
        }

        if let Err(e) = self.shared.remove_organization(organization_id).await {
            warn!(error = %e, "shared cache organization invalidation failed");
        }
    }

    /// Drop everything, both tiers
    pub async fn clear(&self) {
        self.l1.lock().clear();
        if let Err(e) = self.shared.clear().await {
            warn!(error = %e, "shared cache clear failed");
        }
    }

    /// Snapshot of cache counters
    pub fn stats(&self) -> CacheStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let total_hits = l1_hits + l2_hits;
        let l2_lookups = requests.saturating_sub(l1_hits);

        CacheStats {
            l1_hit_rate: ratio(l1_hits, requests),
            l2_hit_rate: ratio(l2_hits, l2_lookups),
            overall_hit_rate: ratio(total_hits, requests),
            l1_size: self.l1.lock().len(),
            l1_evictions: self.l1_evictions.load(Ordering::Relaxed),
            total_requests: requests,
            total_hits,
            total_misses: requests - total_hits,
        }
    }

    fn insert_l1(
        &self,
        key: CacheKey,
        decision: Decision,
        organization_id: &str,
        principal_id: &str,
    ) {
        let entry = L1Entry {
            decision,
            organization_id: organization_id.to_string(),
            principal_id: principal_id.to_string(),
            expires_at: Instant::now() + self.config.l1_ttl,
        };
        let mut l1 = self.l1.lock();
        if let Some((evicted_key, _)) = l1.push(key, entry) {
            if evicted_key != key {
                self.l1_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    pub overall_hit_rate: f64,
    pub l1_size: usize,
    pub l1_evictions: u64,
    pub total_requests: u64,
    pub total_hits: u64,
    pub total_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(principal: &str) -> CacheKey {
        compute_key("org-1", principal, "read", "document", "doc-1")
    }

    #[test]
    fn test_key_covers_identity_fields() {
        let a = compute_key("org-1", "alice", "read", "document", "doc-1");
        let b = compute_key("org-1", "alice", "read", "document", "doc-2");
        let c = compute_key("org-2", "alice", "read", "document", "doc-1");
        assert_ne!(a, b);
        assert_ne!(a, c);

        // Field boundaries matter: ("ab", "c") != ("a", "bc")
        let d = compute_key("org-1", "ab", "c", "document", "doc-1");
        let e = compute_key("org-1", "a", "bc", "document", "doc-1");
        assert_ne!(d, e);
    }

    #[tokio::test]
    async fn test_put_then_get_hits_l1() {
        let cache = DecisionCache::new(CacheConfig::default());
        let key = key_for("alice");

        assert!(cache.get(&key).await.is_none());
        cache
            .put(key, "org-1", "alice", Decision::allow("ok"))
            .await;

        let hit = cache.get(&key).await;
        assert!(hit.is_some());

        let stats = cache.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 1);
        assert!(stats.l1_hit_rate > 0.0);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let config = CacheConfig {
            l1_ttl: Duration::from_millis(40),
            l2_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let cache = DecisionCache::new(config);
        let key = key_for("bob");

        cache.put(key, "org-1", "bob", Decision::deny("no")).await;

        // Let the tier-1 entry expire; tier 2 still holds the decision
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&key).await.is_some());
        assert_eq!(cache.stats().l2_hit_rate, 1.0);

        // The promotion makes the next lookup a tier-1 hit
        assert!(cache.get(&key).await.is_some());
        let stats = cache.stats();
        assert_eq!(stats.total_hits, 2);
        assert!(stats.l1_hit_rate > 0.0);
    }

    #[tokio::test]
    async fn test_expiry_both_tiers() {
        let config = CacheConfig {
            l1_ttl: Duration::from_millis(30),
            l2_ttl: Duration::from_millis(30),
            ..Default::default()
        };
        let cache = DecisionCache::new(config);
        let key = key_for("carol");

        cache
            .put(key, "org-1", "carol", Decision::allow("ok"))
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_principal() {
        let cache = DecisionCache::new(CacheConfig::default());
        let alice = key_for("alice");
        let bob = key_for("bob");

        cache
            .put(alice, "org-1", "alice", Decision::allow("ok"))
            .await;
        cache.put(bob, "org-1", "bob", Decision::allow("ok")).await;

        cache.invalidate_principal("org-1", "alice").await;

        assert!(cache.get(&alice).await.is_none());
        assert!(cache.get(&bob).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_organization() {
        let cache = DecisionCache::new(CacheConfig::default());
        let org1 = compute_key("org-1", "alice", "read", "document", "doc-1");
        let org2 = compute_key("org-2", "dave", "read", "document", "doc-1");

        cache
            .put(org1, "org-1", "alice", Decision::allow("ok"))
            .await;
        cache.put(org2, "org-2", "dave", Decision::allow("ok")).await;

        cache.invalidate_organization("org-1").await;

        assert!(cache.get(&org1).await.is_none());
        assert!(cache.get(&org2).await.is_some());
    }

    #[tokio::test]
    async fn test_l1_eviction_counted() {
        let config = CacheConfig {
            l1_capacity: 2,
            ..Default::default()
        };
        let cache = DecisionCache::new(config);

        for principal in ["a", "b", "c"] {
            cache
                .put(key_for(principal), "org-1", principal, Decision::allow("ok"))
                .await;
        }

        let stats = cache.stats();
        assert_eq!(stats.l1_size, 2);
        assert_eq!(stats.l1_evictions, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = DecisionCache::new(CacheConfig::default());
        let key = key_for("erin");

        cache.put(key, "org-1", "erin", Decision::allow("ok")).await;
        cache.clear().await;

        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.stats().l1_size, 0);
    }
}
