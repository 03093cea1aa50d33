//! Request and decision types for the authorization engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AuthzError, Result};

/// Principal category used for policy input and auditing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    #[default]
    User,
    Service,
    ApiClient,
    System,
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrincipalType::User => "user",
            PrincipalType::Service => "service",
            PrincipalType::ApiClient => "api_client",
            PrincipalType::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// Principal making an authorization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPrincipal {
    /// External principal identifier (e.g. "alice@example.com")
    pub id: String,

    /// Principal type
    #[serde(rename = "type", default)]
    pub principal_type: PrincipalType,

    /// Additional principal attributes
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl RequestPrincipal {
    /// Create a user principal from an external ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            principal_type: PrincipalType::User,
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute to the principal
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Resource targeted by an authorization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResource {
    /// Resource type (e.g. "document", "invoice")
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Resource instance identifier
    pub id: String,

    /// Additional resource attributes
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl RequestResource {
    /// Create a resource reference
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute to the resource
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Authorization request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// Tenant this request is evaluated in
    pub organization_id: String,

    /// Who is making the request
    pub principal: RequestPrincipal,

    /// What action is being performed
    pub action: String,

    /// What resource is being accessed
    pub resource: RequestResource,

    /// Additional context (IP address, request time, arbitrary attributes)
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl AuthorizationRequest {
    /// Create a request with empty context
    pub fn new(
        organization_id: impl Into<String>,
        principal: RequestPrincipal,
        action: impl Into<String>,
        resource: RequestResource,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            principal,
            action: action.into(),
            resource,
            context: HashMap::new(),
        }
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Reject requests with missing identifying fields
    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "organizationId must not be empty".to_string(),
            ));
        }
        if self.principal.id.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "principal.id must not be empty".to_string(),
            ));
        }
        if self.action.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "action must not be empty".to_string(),
            ));
        }
        if self.resource.resource_type.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "resource.type must not be empty".to_string(),
            ));
        }
        if self.resource.id.trim().is_empty() {
            return Err(AuthzError::InvalidRequest(
                "resource.id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of an authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionEffect {
    Allow,
    Deny,
    Error,
}

impl std::fmt::Display for DecisionEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionEffect::Allow => write!(f, "ALLOW"),
            DecisionEffect::Deny => write!(f, "DENY"),
            DecisionEffect::Error => write!(f, "ERROR"),
        }
    }
}

/// Evaluation details attached to a decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    /// Roles resolved for the principal (direct + inherited)
    #[serde(default)]
    pub matched_roles: Vec<String>,

    /// Permissions that produced the decision
    #[serde(default)]
    pub matched_permissions: Vec<String>,

    /// Whether this decision was served from the cache
    #[serde(default)]
    pub cache_hit: bool,

    /// Additional evaluator metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Authorization decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Unique decision identifier
    pub id: String,

    /// ALLOW, DENY, or ERROR. Callers must treat ERROR as a denial.
    #[serde(rename = "decision")]
    pub effect: DecisionEffect,

    /// Human-readable reason for the decision
    pub reason: String,

    /// When the decision was made
    pub timestamp: DateTime<Utc>,

    /// Wall-clock evaluation time for this request
    pub evaluation_time_ms: u64,

    /// Policies that contributed to the decision
    #[serde(default)]
    pub applied_policies: Vec<String>,

    /// Evaluation details
    #[serde(default)]
    pub context: DecisionContext,
}

impl Decision {
    fn new(effect: DecisionEffect, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            effect,
            reason: reason.into(),
            timestamp: Utc::now(),
            evaluation_time_ms: 0,
            applied_policies: Vec::new(),
            context: DecisionContext::default(),
        }
    }

    /// Allow decision
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(DecisionEffect::Allow, reason)
    }

    /// Deny decision
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(DecisionEffect::Deny, reason)
    }

    /// Error decision, produced when evaluation itself failed
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(DecisionEffect::Error, reason)
    }

    /// Attach resolved roles
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.context.matched_roles = roles;
        self
    }

    /// Attach matched permissions
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.context.matched_permissions = permissions;
        self
    }

    /// Attach contributing policies
    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.applied_policies = policies;
        self
    }

    /// Attach evaluator metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.metadata.insert(key.into(), value);
        self
    }

    /// Whether access was granted
    pub fn is_allowed(&self) -> bool {
        self.effect == DecisionEffect::Allow
    }
}

/// Result of a batch authorization call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDecision {
    /// One decision per request, in request order
    pub decisions: Vec<Decision>,

    /// Wall-clock time for the whole batch
    pub total_evaluation_time_ms: u64,
}
