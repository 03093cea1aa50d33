//! Policy lifecycle, versioning, and storage
//!
//! Policies move DRAFT -> ACTIVE -> ARCHIVED. Every content change creates
//! an immutable `PolicyVersion` that is validated synchronously; invalid
//! content is persisted for audit but can never become the active version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditWriter};
use crate::engine::cache::DecisionCache;
use crate::error::{AuthzError, Result};

pub mod evaluator;
pub mod validation;

pub use evaluator::{
    EvaluatorError, PolicyEvaluator, PolicyInput, PolicyPrincipal, PolicyResource, PolicyVerdict,
    RegoConfig, RegoHttpEvaluator, StaticEvaluator,
};
pub use validation::{checksum, PolicyValidator, ValidationIssue, ValidationOutcome};

/// Policy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// Editable, not served
    Draft,
    /// Published and served
    Active,
    /// Retired, read-only
    Archived,
}

/// Policy language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    #[default]
    Rego,
    /// Reserved, not evaluated yet
    Cedar,
}

/// Validation state of one policy version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Valid,
    Invalid,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

/// A named, versioned policy owned by one organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,

    pub organization_id: String,

    /// Unique per organization, case-sensitive
    pub name: String,

    pub status: PolicyStatus,

    /// Number of the newest version that validated cleanly, 0 before any
    /// version has. Only this version can be published.
    pub current_version: u32,

    pub policy_type: PolicyType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        policy_type: PolicyType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            name: name.into(),
            status: PolicyStatus::Draft,
            current_version: 0,
            policy_type,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One immutable snapshot of policy content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub id: Uuid,

    pub policy_id: Uuid,

    /// Monotonic, starting at 1
    pub version: u32,

    pub content: String,

    /// Lowercase SHA-256 hex of `content`
    pub checksum: String,

    pub validation_status: ValidationStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationIssue>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,
}

impl PolicyVersion {
    fn pending(policy_id: Uuid, version: u32, content: String) -> Self {
        let checksum = checksum(&content);
        Self {
            id: Uuid::new_v4(),
            policy_id,
            version,
            content,
            checksum,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            created_at: Utc::now(),
            published_at: None,
            published_by: None,
        }
    }
}

/// Storage for policies and their versions
#[async_trait]
pub trait PolicyVersionStore: Send + Sync {
    async fn get_policy(&self, policy_id: &Uuid) -> Result<Option<Policy>>;

    async fn find_policy_by_name(
        &self,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<Policy>>;

    async fn list_policies(&self, organization_id: &str) -> Result<Vec<Policy>>;

    async fn save_policy(&self, policy: Policy) -> Result<()>;

    async fn save_version(&self, version: PolicyVersion) -> Result<()>;

    async fn get_version(&self, policy_id: &Uuid, version: u32) -> Result<Option<PolicyVersion>>;

    /// All versions of a policy, oldest first
    async fn list_versions(&self, policy_id: &Uuid) -> Result<Vec<PolicyVersion>>;

    /// The current version of an ACTIVE, non-deleted policy, when that
    /// version validated cleanly
    async fn active_version(&self, policy_id: &Uuid) -> Result<Option<PolicyVersion>>;

    async fn update_status(
        &self,
        version_id: &Uuid,
        status: ValidationStatus,
        errors: Vec<ValidationIssue>,
    ) -> Result<()>;

    async fn mark_published(
        &self,
        version_id: &Uuid,
        at: DateTime<Utc>,
        by: Option<String>,
    ) -> Result<()>;
}

/// In-memory policy store implementation
pub struct InMemoryPolicyVersionStore {
    policies: Arc<RwLock<HashMap<Uuid, Policy>>>,
    versions: Arc<RwLock<HashMap<Uuid, PolicyVersion>>>,
}

impl InMemoryPolicyVersionStore {
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
            versions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryPolicyVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyVersionStore for InMemoryPolicyVersionStore {
    async fn get_policy(&self, policy_id: &Uuid) -> Result<Option<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies.get(policy_id).cloned())
    }

    async fn find_policy_by_name(
        &self,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies
            .values()
            .find(|p| p.organization_id == organization_id && p.name == name && !p.is_deleted())
            .cloned())
    }

    async fn list_policies(&self, organization_id: &str) -> Result<Vec<Policy>> {
        let policies = self.policies.read().await;
        let mut matching: Vec<Policy> = policies
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matching)
    }

    async fn save_policy(&self, policy: Policy) -> Result<()> {
        let mut policies = self.policies.write().await;
        policies.insert(policy.id, policy);
        Ok(())
    }

    async fn save_version(&self, version: PolicyVersion) -> Result<()> {
        let mut versions = self.versions.write().await;
        versions.insert(version.id, version);
        Ok(())
    }

    async fn get_version(&self, policy_id: &Uuid, version: u32) -> Result<Option<PolicyVersion>> {
        let versions = self.versions.read().await;
        Ok(versions
            .values()
            .find(|v| v.policy_id == *policy_id && v.version == version)
            .cloned())
    }

    async fn list_versions(&self, policy_id: &Uuid) -> Result<Vec<PolicyVersion>> {
        let versions = self.versions.read().await;
        let mut matching: Vec<PolicyVersion> = versions
            .values()
            .filter(|v| v.policy_id == *policy_id)
            .cloned()
            .collect();
        matching.sort_by_key(|v| v.version);
        Ok(matching)
    }

    async fn active_version(&self, policy_id: &Uuid) -> Result<Option<PolicyVersion>> {
        let policy = match self.get_policy(policy_id).await? {
            Some(p) if p.status == PolicyStatus::Active && !p.is_deleted() => p,
            _ => return Ok(None),
        };
        if policy.current_version == 0 {
            return Ok(None);
        }
        let version = self.get_version(policy_id, policy.current_version).await?;
        Ok(version.filter(|v| v.validation_status == ValidationStatus::Valid))
    }

    async fn update_status(
        &self,
        version_id: &Uuid,
        status: ValidationStatus,
        errors: Vec<ValidationIssue>,
    ) -> Result<()> {
        let mut versions = self.versions.write().await;
        let version = versions
            .get_mut(version_id)
            .ok_or_else(|| AuthzError::NotFound(format!("policy version {}", version_id)))?;
        version.validation_status = status;
        version.validation_errors = errors;
        Ok(())
    }

    async fn mark_published(
        &self,
        version_id: &Uuid,
        at: DateTime<Utc>,
        by: Option<String>,
    ) -> Result<()> {
        let mut versions = self.versions.write().await;
        let version = versions
            .get_mut(version_id)
            .ok_or_else(|| AuthzError::NotFound(format!("policy version {}", version_id)))?;
        version.published_at = Some(at);
        version.published_by = by;
        Ok(())
    }
}

/// Request to create a policy
#[derive(Debug, Clone)]
pub struct PolicyDraft {
    pub organization_id: String,
    pub name: String,
    pub policy_type: PolicyType,
    pub content: String,
    pub actor_id: Option<String>,
}

impl PolicyDraft {
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            policy_type: PolicyType::Rego,
            content: content.into(),
            actor_id: None,
        }
    }

    pub fn with_policy_type(mut self, policy_type: PolicyType) -> Self {
        self.policy_type = policy_type;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Result of a create or update, including the validation outcome.
/// Invalid content is reported here, not as an `Err`.
#[derive(Debug, Clone)]
pub struct PolicyChange {
    pub policy: Policy,
    pub version: PolicyVersion,
    pub outcome: ValidationOutcome,
}

impl PolicyChange {
    pub fn is_valid(&self) -> bool {
        self.outcome.valid
    }
}

/// Manages policy lifecycle over a pluggable store.
///
/// Mutations emit `policy_change` audit records and drop the owning
/// organization's cached decisions.
pub struct PolicyRegistry {
    store: Arc<dyn PolicyVersionStore>,
    validator: PolicyValidator,
    audit: Option<Arc<AuditWriter>>,
    cache: Option<Arc<DecisionCache>>,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn PolicyVersionStore>) -> Self {
        Self {
            store,
            validator: PolicyValidator::new(),
            audit: None,
            cache: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_cache(mut self, cache: Arc<DecisionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Create a policy with its first version
    pub async fn create_policy(&self, draft: PolicyDraft) -> Result<PolicyChange> {
        if draft.organization_id.trim().is_empty() || draft.name.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "policy organization and name are required".to_string(),
            ));
        }
        if self
            .store
            .find_policy_by_name(&draft.organization_id, &draft.name)
            .await?
            .is_some()
        {
            return Err(AuthzError::Conflict(format!(
                "policy '{}' already exists in organization '{}'",
                draft.name, draft.organization_id
            )));
        }

        let mut policy = Policy::new(&draft.organization_id, &draft.name, draft.policy_type);
        let (version, outcome) = self.attach_version(&mut policy, 1, draft.content).await?;
        self.store.save_policy(policy.clone()).await?;

        self.emit_change(&policy, "create", draft.actor_id.as_deref(), &version);
        self.invalidate(&policy.organization_id).await;

        Ok(PolicyChange {
            policy,
            version,
            outcome,
        })
    }

    /// Add a new version with the given content
    pub async fn update_policy(
        &self,
        policy_id: &Uuid,
        content: impl Into<String>,
        actor_id: Option<&str>,
    ) -> Result<PolicyChange> {
        let mut policy = self.require_policy(policy_id).await?;
        if policy.status == PolicyStatus::Archived {
            return Err(AuthzError::InvalidState(
                "cannot update an archived policy".to_string(),
            ));
        }

        let next = self
            .store
            .list_versions(policy_id)
            .await?
            .last()
            .map(|v| v.version + 1)
            .unwrap_or(1);
        let (version, outcome) = self.attach_version(&mut policy, next, content.into()).await?;
        self.store.save_policy(policy.clone()).await?;

        self.emit_change(&policy, "update", actor_id, &version);
        self.invalidate(&policy.organization_id).await;

        Ok(PolicyChange {
            policy,
            version,
            outcome,
        })
    }

    /// Activate the policy's current version
    pub async fn publish(&self, policy_id: &Uuid, actor_id: Option<&str>) -> Result<Policy> {
        let mut policy = self.require_policy(policy_id).await?;
        if policy.status == PolicyStatus::Archived {
            return Err(AuthzError::InvalidState(
                "cannot publish an archived policy".to_string(),
            ));
        }

        let target = if policy.current_version > 0 {
            self.store
                .get_version(policy_id, policy.current_version)
                .await?
        } else {
            // No version has validated yet; report the newest one
            self.store.list_versions(policy_id).await?.pop()
        };
        let target = target.ok_or_else(|| {
            AuthzError::InvalidState(format!("policy '{}' has no versions", policy.name))
        })?;
        if target.validation_status != ValidationStatus::Valid {
            return Err(AuthzError::PublishPrecondition {
                policy: policy.name.clone(),
                version: target.version,
                status: target.validation_status.to_string(),
            });
        }

        self.store
            .mark_published(&target.id, Utc::now(), actor_id.map(str::to_string))
            .await?;
        policy.status = PolicyStatus::Active;
        self.store.save_policy(policy.clone()).await?;

        self.emit_change(&policy, "publish", actor_id, &target);
        self.invalidate(&policy.organization_id).await;

        Ok(policy)
    }

    /// Retire a policy
    pub async fn archive(&self, policy_id: &Uuid, actor_id: Option<&str>) -> Result<Policy> {
        let mut policy = self.require_policy(policy_id).await?;
        if policy.status == PolicyStatus::Archived {
            return Err(AuthzError::InvalidState(
                "policy is already archived".to_string(),
            ));
        }

        policy.status = PolicyStatus::Archived;
        self.store.save_policy(policy.clone()).await?;

        self.emit_audit(&policy, "archive", actor_id, None);
        self.invalidate(&policy.organization_id).await;

        Ok(policy)
    }

    /// Soft-delete a policy. The record and its versions remain for audit.
    pub async fn delete_policy(&self, policy_id: &Uuid, actor_id: Option<&str>) -> Result<Policy> {
        let mut policy = self.require_policy(policy_id).await?;

        policy.deleted_at = Some(Utc::now());
        policy.status = PolicyStatus::Archived;
        self.store.save_policy(policy.clone()).await?;

        self.emit_audit(&policy, "delete", actor_id, None);
        self.invalidate(&policy.organization_id).await;

        Ok(policy)
    }

    pub async fn get_policy(&self, policy_id: &Uuid) -> Result<Option<Policy>> {
        self.store.get_policy(policy_id).await
    }

    pub async fn list_policies(&self, organization_id: &str) -> Result<Vec<Policy>> {
        self.store.list_policies(organization_id).await
    }

    pub async fn versions(&self, policy_id: &Uuid) -> Result<Vec<PolicyVersion>> {
        self.store.list_versions(policy_id).await
    }

    pub async fn active_version(&self, policy_id: &Uuid) -> Result<Option<PolicyVersion>> {
        self.store.active_version(policy_id).await
    }

    async fn require_policy(&self, policy_id: &Uuid) -> Result<Policy> {
        match self.store.get_policy(policy_id).await? {
            Some(policy) if !policy.is_deleted() => Ok(policy),
            _ => Err(AuthzError::NotFound(format!("policy {}", policy_id))),
        }
    }

    /// Persist a pending version, validate it, and advance `current_version`
    /// when it comes back clean
    async fn attach_version(
        &self,
        policy: &mut Policy,
        number: u32,
        content: String,
    ) -> Result<(PolicyVersion, ValidationOutcome)> {
        let mut version = PolicyVersion::pending(policy.id, number, content);
        self.store.save_version(version.clone()).await?;

        let outcome = match policy.policy_type {
            PolicyType::Rego => self.validator.validate(&version.content),
            PolicyType::Cedar => ValidationOutcome {
                valid: false,
                package: None,
                errors: vec![ValidationIssue {
                    line: None,
                    message: "cedar policies cannot be validated yet; only rego is supported"
                        .to_string(),
                }],
            },
        };

        let status = if outcome.valid {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };
        self.store
            .update_status(&version.id, status, outcome.errors.clone())
            .await?;
        version.validation_status = status;
        version.validation_errors = outcome.errors.clone();

        if outcome.valid {
            policy.current_version = number;
        }

        Ok((version, outcome))
    }

    fn emit_change(
        &self,
        policy: &Policy,
        action: &str,
        actor_id: Option<&str>,
        version: &PolicyVersion,
    ) {
        self.emit_audit(
            policy,
            action,
            actor_id,
            Some(serde_json::json!({
                "version": version.version,
                "validation_status": version.validation_status,
                "checksum": version.checksum,
            })),
        );
    }

    fn emit_audit(
        &self,
        policy: &Policy,
        action: &str,
        actor_id: Option<&str>,
        detail: Option<serde_json::Value>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut record =
            AuditRecord::policy_change(&policy.organization_id, action, &policy.id, &policy.name);
        if let Some(actor) = actor_id {
            record = record.with_actor(actor);
        }
        if let Some(detail) = detail {
            record = record.with_response_data(detail);
        }
        audit.record(record);
    }

    async fn invalidate(&self, organization_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_organization(organization_id).await;
        }
    }
}
