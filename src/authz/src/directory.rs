//! Tenant directory entities and read-only lookup store
//!
//! Users, roles, permissions, and role assignments live in an external
//! directory. The engine only reads them, through [`DirectoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// Account status of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Deleted,
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserStatus::Active => write!(f, "active"),
            UserStatus::Inactive => write!(f, "inactive"),
            UserStatus::Suspended => write!(f, "suspended"),
            UserStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Effect of a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionEffect {
    Allow,
    Deny,
}

/// A user account within an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: String,

    /// Identifier the principal presents in requests
    pub external_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    pub status: UserStatus,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl User {
    /// Create an active user
    pub fn new(organization_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            external_id: external_id.into(),
            email: None,
            username: None,
            status: UserStatus::Active,
            attributes: HashMap::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_status(mut self, status: UserStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// A role within an organization's hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: String,

    /// Unique per organization, case-sensitive
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Role this one inherits from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_role_id: Option<Uuid>,

    /// Depth in the hierarchy, 0 for root roles, at most [`crate::rbac::MAX_ROLE_DEPTH`]
    pub level: u8,

    /// System roles cannot be deleted by tenants
    #[serde(default)]
    pub is_system: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    /// Create a root-level role
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            name: name.into(),
            description: None,
            parent_role_id: None,
            level: 0,
            is_system: false,
            deleted_at: None,
        }
    }

    /// Create a child role inheriting from `parent`
    pub fn child_of(parent: &Role, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: parent.organization_id.clone(),
            name: name.into(),
            description: None,
            parent_role_id: Some(parent.id),
            level: parent.level.saturating_add(1),
            is_system: false,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A named grant of an action on a resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub organization_id: String,

    /// Unique per organization (e.g. "document.read")
    pub name: String,

    pub resource_type: String,
    pub action: String,
    pub effect: PermissionEffect,

    /// Attribute conditions, forwarded to policy evaluation as written
    #[serde(default)]
    pub conditions: HashMap<String, serde_json::Value>,
}

impl Permission {
    /// Create an allow permission
    pub fn allow(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            name: name.into(),
            resource_type: resource_type.into(),
            action: action.into(),
            effect: PermissionEffect::Allow,
            conditions: HashMap::new(),
        }
    }

    /// Create a deny permission
    pub fn deny(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            effect: PermissionEffect::Deny,
            ..Self::allow(organization_id, name, resource_type, action)
        }
    }

    pub fn with_condition(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }
}

/// Assignment of a role to a user, optionally scoped and time-limited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<String>,

    pub granted_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Set for type-scoped and instance-scoped assignments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    /// Set only for instance-scoped assignments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl UserRole {
    /// Grant a role globally (all resources)
    pub fn grant(user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            user_id,
            role_id,
            granted_by: None,
            granted_at: Utc::now(),
            expires_at: None,
            resource_type: None,
            resource_id: None,
        }
    }

    pub fn granted_by(mut self, grantor: impl Into<String>) -> Self {
        self.granted_by = Some(grantor.into());
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Restrict the assignment to one resource type
    pub fn scoped_to_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = None;
        self
    }

    /// Restrict the assignment to a single resource instance
    pub fn scoped_to_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Whether this assignment contributes its role for the given resource.
    ///
    /// Global assignments apply everywhere; type-scoped assignments apply to
    /// all instances of their resource type; instance-scoped assignments
    /// apply to exactly one resource.
    pub fn applies_to(&self, resource_type: &str, resource_id: &str) -> bool {
        match (&self.resource_type, &self.resource_id) {
            (None, _) => true,
            (Some(t), None) => t.eq_ignore_ascii_case(resource_type),
            (Some(t), Some(id)) => t.eq_ignore_ascii_case(resource_type) && id == resource_id,
        }
    }
}

/// Read-only view of the tenant directory
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Look up a user by the identifier principals present in requests
    async fn find_user_by_external_id(
        &self,
        organization_id: &str,
        external_id: &str,
    ) -> Result<Option<User>>;

    /// Non-expired role assignments for a user as of `now`
    async fn find_role_assignments(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserRole>>;

    /// Look up a role by ID
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>>;

    /// Permissions granted to a role
    async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<Permission>>;
}

/// In-memory directory store
pub struct InMemoryDirectoryStore {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
    roles: Arc<RwLock<HashMap<Uuid, Role>>>,
    permissions: Arc<RwLock<HashMap<Uuid, Permission>>>,
    role_permissions: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
    assignments: Arc<RwLock<HashMap<Uuid, Vec<UserRole>>>>,
}

impl InMemoryDirectoryStore {
    /// Create an empty directory store
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            roles: Arc::new(RwLock::new(HashMap::new())),
            permissions: Arc::new(RwLock::new(HashMap::new())),
            role_permissions: Arc::new(RwLock::new(HashMap::new())),
            assignments: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a user
    pub async fn add_user(&self, user: User) {
        let mut users = self.users.write().await;
        users.insert(user.id, user);
    }

    /// Add a role
    pub async fn add_role(&self, role: Role) {
        let mut roles = self.roles.write().await;
        roles.insert(role.id, role);
    }

    /// Add a permission
    pub async fn add_permission(&self, permission: Permission) {
        let mut permissions = self.permissions.write().await;
        permissions.insert(permission.id, permission);
    }

    /// Attach a permission to a role
    pub async fn grant_permission(&self, role_id: Uuid, permission_id: Uuid) {
        let mut role_permissions = self.role_permissions.write().await;
        role_permissions.entry(role_id).or_default().push(permission_id);
    }

    /// Assign a role to a user
    pub async fn assign_role(&self, assignment: UserRole) {
        let mut assignments = self.assignments.write().await;
        assignments
            .entry(assignment.user_id)
            .or_default()
            .push(assignment);
    }

    /// Remove all role assignments for a user
    pub async fn revoke_roles(&self, user_id: Uuid) {
        let mut assignments = self.assignments.write().await;
        assignments.remove(&user_id);
    }
}

impl Default for InMemoryDirectoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectoryStore {
    async fn find_user_by_external_id(
        &self,
        organization_id: &str,
        external_id: &str,
    ) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.organization_id == organization_id && u.external_id == external_id)
            .cloned())
    }

    async fn find_role_assignments(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserRole>> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .get(&user_id)
            .map(|list| {
                list.iter()
                    .filter(|a| !a.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>> {
        let roles = self.roles.read().await;
        Ok(roles.get(&role_id).cloned())
    }

    async fn find_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<Permission>> {
        let role_permissions = self.role_permissions.read().await;
        let permissions = self.permissions.read().await;

        Ok(role_permissions
            .get(&role_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| permissions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
