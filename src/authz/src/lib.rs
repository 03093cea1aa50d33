//! # Verdict Authorization Engine
//!
//! Multi-tenant authorization decision service combining role-based access
//! control with an external policy evaluator.
//!
//! ## Features
//!
//! - **Role hierarchy** with permission inheritance and cycle tolerance
//! - **Policy adapter** for OPA-compatible evaluators, with graceful
//!   fallback to role evaluation on any failure
//! - **Two-tier decision cache** (in-process LRU over a shared tier) with
//!   principal- and organization-level invalidation
//! - **Batch evaluation** with bounded concurrency and per-item isolation
//! - **Async audit trail** that never blocks the decision path
//! - **Policy versioning** with validation and content checksums
//! - **Prometheus metrics** for decisions, cache, and latency
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use verdict_authz::directory::{InMemoryDirectoryStore, Permission, Role, User, UserRole};
//! use verdict_authz::engine::{AuthzEngine, EngineConfig};
//! use verdict_authz::types::{AuthorizationRequest, RequestPrincipal, RequestResource};
//!
//! #[tokio::main]
//! async fn main() -> verdict_authz::Result<()> {
//!     let directory = Arc::new(InMemoryDirectoryStore::new());
//!
//!     let user = User::new("acme", "alice@example.com");
//!     let role = Role::new("acme", "viewer");
//!     let permission = Permission::allow("acme", "document.read", "document", "read");
//!     directory.add_user(user.clone()).await;
//!     directory.add_role(role.clone()).await;
//!     directory.add_permission(permission.clone()).await;
//!     directory.grant_permission(role.id, permission.id).await;
//!     directory.assign_role(UserRole::grant(user.id, role.id)).await;
//!
//!     let engine = AuthzEngine::new(EngineConfig::default(), directory);
//!
//!     let request = AuthorizationRequest::new(
//!         "acme",
//!         RequestPrincipal::new("alice@example.com"),
//!         "read",
//!         RequestResource::new("document", "doc-1"),
//!     );
//!     let decision = engine.authorize(&request).await?;
//!     assert!(decision.is_allowed());
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod directory;
pub mod engine;
pub mod error;
pub mod policy;
pub mod rbac;
pub mod types;

// Re-export commonly used types
pub use engine::{AuthzEngine, CacheConfig, CacheStats, DecisionCache, EngineConfig};
pub use error::{AuthzError, Result};
pub use policy::{Policy, PolicyDraft, PolicyRegistry, PolicyStatus, PolicyVersion};
pub use types::{
    AuthorizationRequest, BatchDecision, Decision, DecisionEffect, RequestPrincipal,
    RequestResource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
