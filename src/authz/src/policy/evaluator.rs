//! Pluggable policy engine adapter
//!
//! Attribute-based rules are evaluated by an external Rego-style policy
//! engine. The engine posts a structured input document and reads back an
//! allow/deny verdict. Every adapter failure is a typed error; the caller
//! falls back to role evaluation and never surfaces adapter failures to
//! clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::error::{AuthzError, Result};

/// Policy engine adapter configuration
#[derive(Debug, Clone)]
pub struct RegoConfig {
    /// Policy engine base URL (e.g. "http://localhost:8181")
    pub url: String,

    /// Decision document path (e.g. "v1/data/verdict/authz")
    pub decision_path: String,

    /// HTTP request timeout
    pub timeout: Duration,

    /// Whether the adapter is enabled
    pub enabled: bool,
}

impl Default for RegoConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8181".to_string(),
            decision_path: "v1/data/verdict/authz".to_string(),
            timeout: Duration::from_millis(500),
            enabled: false,
        }
    }
}

/// Principal section of the policy input document
#[derive(Debug, Clone, Serialize)]
pub struct PolicyPrincipal {
    pub id: String,

    #[serde(rename = "type")]
    pub principal_type: String,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Resource section of the policy input document
#[derive(Debug, Clone, Serialize)]
pub struct PolicyResource {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub id: String,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Input document sent to the policy engine.
///
/// Serialized as `{"input": <PolicyInput>}` on the wire. The context always
/// carries `timestamp` (RFC 3339) and `organization_id`; policies must read
/// time from there rather than the engine's own clock.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub principal: PolicyPrincipal,
    pub action: String,
    pub resource: PolicyResource,
    pub context: HashMap<String, serde_json::Value>,
}

/// Wrapper for the policy engine request body: `{"input": <PolicyInput>}`
#[derive(Debug, Serialize)]
struct RegoRequest<'a> {
    input: &'a PolicyInput,
}

/// Top-level policy engine response envelope
#[derive(Debug, Clone, Deserialize)]
struct RegoResponse {
    /// Absent when the decision document is undefined
    result: Option<PolicyVerdict>,
}

/// Verdict returned by the policy engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyVerdict {
    /// Whether the action is allowed
    pub allow: bool,

    /// Human-readable reasons for the verdict
    #[serde(default)]
    pub reasons: Vec<String>,

    /// Identifiers of the policies that matched
    #[serde(default)]
    pub matched_policies: Vec<String>,

    /// Additional evaluator metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Errors from the policy engine adapter
#[derive(Debug, Clone, Error)]
pub enum EvaluatorError {
    /// Request to the policy engine timed out
    #[error("policy engine timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP request failed before a response arrived
    #[error("policy engine request failed: {0}")]
    Transport(String),

    /// Policy engine returned a non-2xx status
    #[error("policy engine returned HTTP {0}")]
    Status(u16),

    /// Response body could not be interpreted
    #[error("policy engine response malformed: {0}")]
    Malformed(String),

    /// Adapter is disabled by configuration
    #[error("policy engine disabled")]
    Disabled,
}

/// Pluggable policy evaluator
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate the input document and return a verdict
    async fn evaluate(
        &self,
        input: &PolicyInput,
    ) -> std::result::Result<PolicyVerdict, EvaluatorError>;
}

/// HTTP client for a Rego-style policy engine
pub struct RegoHttpEvaluator {
    config: RegoConfig,
    http: reqwest::Client,
}

impl RegoHttpEvaluator {
    /// Create a new evaluator from the given configuration
    pub fn new(config: RegoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthzError::Evaluation(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// Get a reference to the underlying configuration
    pub fn config(&self) -> &RegoConfig {
        &self.config
    }

    fn decision_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.decision_path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl PolicyEvaluator for RegoHttpEvaluator {
    async fn evaluate(
        &self,
        input: &PolicyInput,
    ) -> std::result::Result<PolicyVerdict, EvaluatorError> {
        if !self.config.enabled {
            return Err(EvaluatorError::Disabled);
        }

        let body = RegoRequest { input };
        let response = self
            .http
            .post(self.decision_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EvaluatorError::Timeout(self.config.timeout)
                } else {
                    EvaluatorError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvaluatorError::Status(status.as_u16()));
        }

        let envelope: RegoResponse = response
            .json()
            .await
            .map_err(|e| EvaluatorError::Malformed(e.to_string()))?;

        envelope
            .result
            .ok_or_else(|| EvaluatorError::Malformed("decision document undefined".to_string()))
    }
}

/// Evaluator returning a fixed outcome, for embedding and tests
pub struct StaticEvaluator {
    outcome: std::result::Result<PolicyVerdict, EvaluatorError>,
}

impl StaticEvaluator {
    /// Always allow, with the given reason
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            outcome: Ok(PolicyVerdict {
                allow: true,
                reasons: vec![reason.into()],
                ..Default::default()
            }),
        }
    }

    /// Always deny, with the given reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: Ok(PolicyVerdict {
                allow: false,
                reasons: vec![reason.into()],
                ..Default::default()
            }),
        }
    }

    /// Always return the given verdict
    pub fn verdict(verdict: PolicyVerdict) -> Self {
        Self {
            outcome: Ok(verdict),
        }
    }

    /// Always fail with the given error
    pub fn failing(error: EvaluatorError) -> Self {
        Self {
            outcome: Err(error),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticEvaluator {
    async fn evaluate(
        &self,
        _input: &PolicyInput,
    ) -> std::result::Result<PolicyVerdict, EvaluatorError> {
        self.outcome.clone()
    }
}
