//! Decision cache integration tests
//!
//! Hit/miss behavior through the engine, key semantics, TTL expiry across
//! both tiers, and targeted invalidation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::sleep;
use uuid::Uuid;

use verdict_authz::directory::{
    DirectoryStore, InMemoryDirectoryStore, Permission, Role, User, UserRole,
};
use verdict_authz::engine::{AuthzEngine, CacheConfig, EngineConfig};
use verdict_authz::error::Result;
use verdict_authz::types::{
    AuthorizationRequest, DecisionEffect, RequestPrincipal, RequestResource,
};

async fn seeded_directory() -> (Arc<InMemoryDirectoryStore>, User) {
    let directory = Arc::new(InMemoryDirectoryStore::new());

    let editor = Role::new("org-1", "editor");
    let read = Permission::allow("org-1", "document.read", "document", "read");
    let alice = User::new("org-1", "alice@example.com");
    let bob = User::new("org-1", "bob@example.com");

    directory.add_role(editor.clone()).await;
    directory.add_permission(read.clone()).await;
    directory.grant_permission(editor.id, read.id).await;
    directory.add_user(alice.clone()).await;
    directory.add_user(bob.clone()).await;
    directory.assign_role(UserRole::grant(alice.id, editor.id)).await;

    (directory, alice)
}

fn request(principal: &str, resource_id: &str) -> AuthorizationRequest {
    AuthorizationRequest::new(
        "org-1",
        RequestPrincipal::new(principal),
        "read",
        RequestResource::new("document", resource_id),
    )
}

fn config_with_ttls(l1_ttl: Duration, l2_ttl: Duration) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            l1_ttl,
            l2_ttl,
            ..CacheConfig::default()
        },
        ..EngineConfig::default()
    }
}

// ============================================================================
// BASIC CACHE BEHAVIOR
// ============================================================================

#[tokio::test]
async fn test_second_identical_request_served_from_cache() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    let second = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();

    assert!(!first.context.cache_hit);
    assert!(second.context.cache_hit);
    // The cached decision is the stored one, not a recomputation
    assert_eq!(second.id, first.id);
    assert_eq!(second.effect, DecisionEffect::Allow);

    let stats = engine.cache_stats().unwrap();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.total_hits, 1);
}

#[tokio::test]
async fn test_context_and_attributes_do_not_affect_key() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();

    let mut req = request("alice@example.com", "doc-1")
        .with_context("ip", json!("10.0.0.9"))
        .with_context("session", json!("abc123"));
    req.principal = RequestPrincipal::new("alice@example.com")
        .with_attribute("department", json!("finance"));

    let second = engine.authorize(&req).await.unwrap();

    assert!(second.context.cache_hit);
    assert_eq!(second.id, first.id);
}

#[tokio::test]
async fn test_distinct_principals_have_distinct_entries() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    let alice = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    // bob has no roles; he must not inherit alice's cached ALLOW
    let bob = engine.authorize(&request("bob@example.com", "doc-1")).await.unwrap();

    assert_eq!(alice.effect, DecisionEffect::Allow);
    assert_eq!(bob.effect, DecisionEffect::Deny);
    assert!(!bob.context.cache_hit);
}

// ============================================================================
// TTL AND TIER PROMOTION
// ============================================================================

#[tokio::test]
async fn test_l2_serves_after_l1_expiry() {
    let (directory, _) = seeded_directory().await;
    let config = config_with_ttls(Duration::from_millis(40), Duration::from_secs(10));
    let engine = AuthzEngine::new(config, directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    sleep(Duration::from_millis(80)).await;
    let second = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();

    assert!(second.context.cache_hit);
    assert_eq!(second.id, first.id);

    let stats = engine.cache_stats().unwrap();
    assert!(stats.l2_hit_rate > 0.0, "hit should come from the shared tier");
}

#[tokio::test]
async fn test_full_expiry_recomputes() {
    let (directory, _) = seeded_directory().await;
    let config = config_with_ttls(Duration::from_millis(40), Duration::from_millis(40));
    let engine = AuthzEngine::new(config, directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    sleep(Duration::from_millis(120)).await;
    let second = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();

    assert!(!second.context.cache_hit);
    assert_ne!(second.id, first.id);
    assert_eq!(second.effect, DecisionEffect::Allow);
}

#[tokio::test]
async fn test_l1_eviction_falls_back_to_shared_tier() {
    let (directory, _) = seeded_directory().await;
    let config = EngineConfig {
        cache: CacheConfig {
            l1_capacity: 1,
            ..CacheConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = AuthzEngine::new(config, directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    // doc-2 evicts doc-1 from the single-slot tier 1
    engine.authorize(&request("alice@example.com", "doc-2")).await.unwrap();
    let third = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();

    assert!(third.context.cache_hit);
    assert_eq!(third.id, first.id);

    let stats = engine.cache_stats().unwrap();
    assert!(stats.l1_evictions >= 1);
    assert!(stats.l2_hit_rate > 0.0);
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_invalidate_principal_is_scoped() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    engine.authorize(&request("bob@example.com", "doc-1")).await.unwrap();

    engine.invalidate_principal("org-1", "alice@example.com").await;

    let alice = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    let bob = engine.authorize(&request("bob@example.com", "doc-1")).await.unwrap();

    assert!(!alice.context.cache_hit, "alice's entries were invalidated");
    assert!(bob.context.cache_hit, "bob's entries were untouched");
}

#[tokio::test]
async fn test_invalidate_organization_clears_all_principals() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    engine.authorize(&request("bob@example.com", "doc-1")).await.unwrap();

    engine.invalidate_organization("org-1").await;

    let alice = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    let bob = engine.authorize(&request("bob@example.com", "doc-1")).await.unwrap();

    assert!(!alice.context.cache_hit);
    assert!(!bob.context.cache_hit);
}

#[tokio::test]
async fn test_revocation_takes_effect_after_invalidation() {
    let (directory, alice) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory.clone());

    let before = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert_eq!(before.effect, DecisionEffect::Allow);

    directory.revoke_roles(alice.id).await;

    // Until invalidated, the cached ALLOW is still served
    let stale = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert_eq!(stale.effect, DecisionEffect::Allow);
    assert!(stale.context.cache_hit);

    engine.invalidate_principal("org-1", "alice@example.com").await;

    let fresh = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert_eq!(fresh.effect, DecisionEffect::Deny);
    assert_eq!(fresh.reason, "User has no roles assigned");
}

#[tokio::test]
async fn test_clear_cache_drops_everything() {
    let (directory, _) = seeded_directory().await;
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    engine.clear_cache().await;

    let decision = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert!(!decision.context.cache_hit);
    assert_eq!(engine.cache_stats().unwrap().l1_size, 1);
}

// ============================================================================
// ERROR DECISIONS
// ============================================================================

#[tokio::test]
async fn test_error_decisions_are_not_cached() {
    /// Fails the first lookup, then behaves like an empty directory
    struct FlakyDirectory {
        failed_once: AtomicBool,
        inner: Arc<InMemoryDirectoryStore>,
    }

    #[async_trait::async_trait]
    impl DirectoryStore for FlakyDirectory {
        async fn find_user_by_external_id(
            &self,
            organization_id: &str,
            external_id: &str,
        ) -> Result<Option<User>> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(verdict_authz::AuthzError::Store(
                    "transient backend failure".to_string(),
                ));
            }
            self.inner
                .find_user_by_external_id(organization_id, external_id)
                .await
        }

        async fn find_role_assignments(
            &self,
            user_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<Vec<UserRole>> {
            self.inner.find_role_assignments(user_id, now).await
        }

        async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>> {
            self.inner.find_role(role_id).await
        }

        async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<Permission>> {
            self.inner.find_permissions_for_role(role_id).await
        }
    }

    let (inner, _) = seeded_directory().await;
    let directory = Arc::new(FlakyDirectory {
        failed_once: AtomicBool::new(false),
        inner,
    });
    let engine = AuthzEngine::new(EngineConfig::default(), directory);

    let first = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert_eq!(first.effect, DecisionEffect::Error);

    // The failure was not cached; recovery is immediate
    let second = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert_eq!(second.effect, DecisionEffect::Allow);
    assert!(!second.context.cache_hit);

    let third = engine.authorize(&request("alice@example.com", "doc-1")).await.unwrap();
    assert!(third.context.cache_hit);
    assert_eq!(third.effect, DecisionEffect::Allow);
}
