//! Authorization decision engine
//!
//! Orchestrates the full decision pipeline: request validation, cache
//! lookup, user resolution, the external policy adapter with role-based
//! fallback, decision assembly, write-through caching, audit, and metrics.

pub mod batch;
pub mod cache;
pub mod metrics;

pub use cache::{CacheConfig, CacheStats, DecisionCache, InMemorySharedCache, SharedDecisionCache};
pub use metrics::{EngineMetrics, MetricsCollector};

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditRecord, AuditWriter};
use crate::directory::{DirectoryStore, User, UserRole, UserStatus};
use crate::error::Result;
use crate::policy::evaluator::{PolicyEvaluator, PolicyInput, PolicyPrincipal, PolicyResource, PolicyVerdict};
use crate::rbac::{find_allow_match, RbacResolver};
use crate::types::{AuthorizationRequest, Decision, DecisionEffect};

/// Decision engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Enable the two-tier decision cache
    pub enable_cache: bool,

    /// Cache tier configuration
    pub cache: CacheConfig,

    /// Upper bound on one policy adapter call
    pub policy_timeout: Duration,

    /// Concurrent evaluations per batch
    pub batch_concurrency: usize,

    /// Bounded audit queue length
    pub audit_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache: CacheConfig::default(),
            policy_timeout: Duration::from_millis(500),
            batch_concurrency: 16,
            audit_queue_capacity: 1024,
        }
    }
}

/// Multi-tenant authorization decision engine.
///
/// # Pipeline
///
/// 1. Validate the request (blank identity fields are client errors)
/// 2. Cache lookup; a hit returns immediately and is still audited
/// 3. Resolve the principal to a user record; unknown or non-active
///    users are denied
/// 4. Policy adapter, when configured: a verdict is authoritative, any
///    failure falls back to role evaluation
/// 5. Role hierarchy and permission matching
/// 6. Write-through cache, audit enqueue, metrics
///
/// Internal failures surface as decisions with `effect = ERROR`; callers
/// must treat ERROR as a denial.
pub struct AuthzEngine {
    directory: Arc<dyn DirectoryStore>,
    rbac: RbacResolver,
    evaluator: Option<Arc<dyn PolicyEvaluator>>,
    cache: Option<Arc<DecisionCache>>,
    audit: Option<Arc<AuditWriter>>,
    metrics: Arc<MetricsCollector>,
    config: EngineConfig,
}

impl AuthzEngine {
    /// Create an engine over the given directory
    pub fn new(config: EngineConfig, directory: Arc<dyn DirectoryStore>) -> Self {
        let cache = config
            .enable_cache
            .then(|| Arc::new(DecisionCache::new(config.cache.clone())));

        info!(
            cache = config.enable_cache,
            policy_timeout_ms = config.policy_timeout.as_millis() as u64,
            batch_concurrency = config.batch_concurrency,
            "authorization engine initialized"
        );

        Self {
            rbac: RbacResolver::new(directory.clone()),
            directory,
            evaluator: None,
            cache,
            audit: None,
            metrics: Arc::new(MetricsCollector::new()),
            config,
        }
    }

    /// Attach an external policy evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Replace the default shared cache tier (e.g. with a Redis-backed one)
    pub fn with_shared_cache(mut self, shared: Arc<dyn SharedDecisionCache>) -> Self {
        if self.config.enable_cache {
            self.cache = Some(Arc::new(DecisionCache::with_shared(
                self.config.cache.clone(),
                shared,
            )));
        }
        self
    }

    /// Attach the audit pipeline
    pub fn with_audit(mut self, audit: Arc<AuditWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Authorize a single request.
    ///
    /// Returns `Err` only for client errors (blank identity fields);
    /// everything else becomes a `Decision`.
    pub async fn authorize(&self, request: &AuthorizationRequest) -> Result<Decision> {
        self.authorize_inner(request, None).await
    }

    /// Authorize with a caller-imposed deadline. The policy adapter call is
    /// trimmed to the remaining budget; if the whole evaluation overruns,
    /// the result is an ERROR decision with a timeout reason.
    pub async fn authorize_within(
        &self,
        request: &AuthorizationRequest,
        budget: Duration,
    ) -> Result<Decision> {
        request.validate()?;
        let start = Instant::now();
        let deadline = start.checked_add(budget);

        match tokio::time::timeout(budget, self.authorize_inner(request, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    principal = %request.principal.id,
                    "authorization timed out"
                );
                let mut decision = Decision::error(format!(
                    "Authorization timed out after {} ms",
                    budget.as_millis()
                ));
                decision.evaluation_time_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_decision(DecisionEffect::Error);
                self.metrics.record_latency(start.elapsed());
                self.audit_decision(request, &decision);
                Ok(decision)
            }
        }
    }

    async fn authorize_inner(
        &self,
        request: &AuthorizationRequest,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        request.validate()?;
        let start = Instant::now();

        debug!(
            organization = %request.organization_id,
            principal = %request.principal.id,
            action = %request.action,
            resource_type = %request.resource.resource_type,
            resource = %request.resource.id,
            "authorization request"
        );

        let key = cache::compute_key(
            &request.organization_id,
            &request.principal.id,
            &request.action,
            &request.resource.resource_type,
            &request.resource.id,
        );

        if let Some(cache) = &self.cache {
            if let Some(mut cached) = cache.get(&key).await {
                cached.context.cache_hit = true;
                cached.evaluation_time_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_cache_hit();
                self.metrics.record_decision(cached.effect);
                self.metrics.record_latency(start.elapsed());
                self.audit_decision(request, &cached);
                debug!("decision served from cache");
                return Ok(cached);
            }
            self.metrics.record_cache_miss();
        }

        let mut decision = match self.compute_decision(request, deadline).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "authorization evaluation failed");
                Decision::error(format!("Evaluation failed: {}", e))
            }
        };
        decision.evaluation_time_ms = start.elapsed().as_millis() as u64;

        self.metrics.record_decision(decision.effect);
        self.metrics.record_latency(start.elapsed());

        // ERROR decisions describe a transient failure and are never cached
        if decision.effect != DecisionEffect::Error {
            if let Some(cache) = &self.cache {
                cache
                    .put(
                        key,
                        &request.organization_id,
                        &request.principal.id,
                        decision.clone(),
                    )
                    .await;
            }
        }

        self.audit_decision(request, &decision);
        Ok(decision)
    }

    async fn compute_decision(
        &self,
        request: &AuthorizationRequest,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        let user = match self
            .directory
            .find_user_by_external_id(&request.organization_id, &request.principal.id)
            .await?
        {
            Some(user) => user,
            None => {
                debug!(principal = %request.principal.id, "principal not found in organization");
                return Ok(Decision::deny(
                    "Principal is not a known user in this organization",
                ));
            }
        };
        if user.status != UserStatus::Active {
            return Ok(Decision::deny(format!("User account is {}", user.status)));
        }

        if let Some(evaluator) = &self.evaluator {
            let budget = match deadline {
                Some(deadline) => self
                    .config
                    .policy_timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.config.policy_timeout,
            };
            if budget.is_zero() {
                warn!("no budget left for policy evaluation, falling back to role evaluation");
                self.metrics.record_policy_fallback();
            } else {
                let input = build_policy_input(request, &user);
                match tokio::time::timeout(budget, evaluator.evaluate(&input)).await {
                    Ok(Ok(verdict)) => {
                        debug!(allow = verdict.allow, "policy verdict");
                        return Ok(decision_from_verdict(verdict));
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "policy evaluation failed, falling back to role evaluation");
                        self.metrics.record_policy_fallback();
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = budget.as_millis() as u64,
                            "policy evaluation timed out, falling back to role evaluation"
                        );
                        self.metrics.record_policy_fallback();
                    }
                }
            }
        }

        self.evaluate_rbac(request, &user).await
    }

    /// Role-based evaluation: resolve the hierarchy, aggregate permissions,
    /// and look for an allow match
    async fn evaluate_rbac(
        &self,
        request: &AuthorizationRequest,
        user: &User,
    ) -> Result<Decision> {
        let assignments = self
            .directory
            .find_role_assignments(user.id, Utc::now())
            .await?;
        if assignments.is_empty() {
            return Ok(rbac_decision(Decision::deny("User has no roles assigned")));
        }

        let applicable: Vec<UserRole> = assignments
            .into_iter()
            .filter(|a| a.applies_to(&request.resource.resource_type, &request.resource.id))
            .collect();
        if applicable.is_empty() {
            return Ok(rbac_decision(Decision::deny(
                "User has no roles applicable to this resource",
            )));
        }

        let roles = self.rbac.resolve_roles(&applicable).await?;
        if roles.is_empty() {
            return Ok(rbac_decision(Decision::deny("User has no roles assigned")));
        }
        let role_names: Vec<String> = roles.iter().map(|r| r.name.clone()).collect();

        let grants = self.rbac.collect_permissions(&roles).await?;
        if grants.is_empty() {
            return Ok(rbac_decision(
                Decision::deny("User's roles grant no permissions").with_roles(role_names),
            ));
        }

        let decision = match find_allow_match(
            &grants,
            &request.resource.resource_type,
            &request.action,
        ) {
            Some(grant) => Decision::allow(format!(
                "Permission '{}' granted via role '{}'",
                grant.permission.name, grant.via_role
            ))
            .with_permissions(vec![grant.permission.name.clone()]),
            None => Decision::deny(format!(
                "No permission allows action '{}' on resource type '{}'",
                request.action, request.resource.resource_type
            )),
        };

        Ok(rbac_decision(decision.with_roles(role_names)))
    }

    fn audit_decision(&self, request: &AuthorizationRequest, decision: &Decision) {
        let Some(audit) = &self.audit else {
            return;
        };
        let record = AuditRecord::authorization(
            &request.organization_id,
            &request.principal.id,
            &request.action,
            &request.resource.resource_type,
            &request.resource.id,
            decision.effect,
            decision.reason.clone(),
        )
        .with_response_data(json!({
            "decision_id": decision.id,
            "cache_hit": decision.context.cache_hit,
            "evaluation_time_ms": decision.evaluation_time_ms,
        }));
        if !audit.record(record) {
            self.metrics.record_audit_drop();
        }
    }

    /// Drop cached decisions for one principal, both tiers
    pub async fn invalidate_principal(&self, organization_id: &str, principal_id: &str) {
        if let Some(cache) = &self.cache {
            cache
                .invalidate_principal(organization_id, principal_id)
                .await;
            info!(
                organization = %organization_id,
                principal = %principal_id,
                "cached decisions invalidated for principal"
            );
        }
    }

    /// Drop cached decisions for a whole organization, both tiers
    pub async fn invalidate_organization(&self, organization_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_organization(organization_id).await;
            info!(organization = %organization_id, "cached decisions invalidated for organization");
        }
    }

    /// Drop every cached decision
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
            info!("decision cache cleared");
        }
    }

    /// Cache handle for collaborators that invalidate on mutation
    pub fn decision_cache(&self) -> Option<Arc<DecisionCache>> {
        self.cache.clone()
    }

    /// Audit pipeline handle
    pub fn audit_writer(&self) -> Option<Arc<AuditWriter>> {
        self.audit.clone()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Point-in-time metrics snapshot
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    /// Prometheus text exposition, including cache gauges
    pub fn export_prometheus(&self) -> String {
        let mut out = self.metrics.export_prometheus();
        if let Some(stats) = self.cache_stats() {
            out.push_str("# HELP authz_cache_l1_size Entries resident in the in-process cache tier\n");
            out.push_str("# TYPE authz_cache_l1_size gauge\n");
            out.push_str(&format!("authz_cache_l1_size {}\n", stats.l1_size));
            out.push_str("# HELP authz_cache_l1_evictions_total LRU evictions from the in-process tier\n");
            out.push_str("# TYPE authz_cache_l1_evictions_total counter\n");
            out.push_str(&format!("authz_cache_l1_evictions_total {}\n", stats.l1_evictions));
            out.push_str("# HELP authz_cache_hit_rate Overall decision cache hit rate\n");
            out.push_str("# TYPE authz_cache_hit_rate gauge\n");
            out.push_str(&format!("authz_cache_hit_rate {:.4}\n", stats.overall_hit_rate));
        }
        out
    }
}

fn rbac_decision(decision: Decision) -> Decision {
    decision.with_metadata("evaluation_path", json!("rbac"))
}

fn decision_from_verdict(verdict: PolicyVerdict) -> Decision {
    let reason = if verdict.reasons.is_empty() {
        if verdict.allow {
            "Policy evaluation allowed this action".to_string()
        } else {
            "Policy evaluation denied this action".to_string()
        }
    } else {
        verdict.reasons.join("; ")
    };

    let mut decision = if verdict.allow {
        Decision::allow(reason)
    } else {
        Decision::deny(reason)
    };
    decision = decision
        .with_policies(verdict.matched_policies)
        .with_metadata("evaluation_path", json!("policy"));
    for (key, value) in verdict.metadata {
        decision = decision.with_metadata(key, value);
    }
    decision
}

/// Assemble the input document for the policy adapter. Stored user fields
/// override caller-supplied attributes; the context always carries the
/// organization and an RFC 3339 timestamp.
fn build_policy_input(request: &AuthorizationRequest, user: &User) -> PolicyInput {
    let mut attributes = user.attributes.clone();
    for (key, value) in &request.principal.attributes {
        attributes.insert(key.clone(), value.clone());
    }
    if let Some(email) = &user.email {
        attributes.insert("email".to_string(), json!(email));
    }
    if let Some(username) = &user.username {
        attributes.insert("username".to_string(), json!(username));
    }
    attributes.insert("status".to_string(), json!(user.status.to_string()));

    let mut context = request.context.clone();
    context.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    context.insert(
        "organization_id".to_string(),
        json!(request.organization_id),
    );

    PolicyInput {
        principal: PolicyPrincipal {
            id: request.principal.id.clone(),
            principal_type: request.principal.principal_type.to_string(),
            attributes,
        },
        action: request.action.clone(),
        resource: PolicyResource {
            resource_type: request.resource.resource_type.clone(),
            id: request.resource.id.clone(),
            attributes: request.resource.attributes.clone(),
        },
        context,
    }
}
