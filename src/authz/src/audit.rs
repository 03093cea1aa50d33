//! Audit trail for authorization decisions and administrative changes
//!
//! Records are enqueued on a bounded channel and persisted by a background
//! worker, so the authorize path never waits on the sink. When the queue is
//! full the newest record is dropped, counted, and logged. Retention is
//! age-based and runs as a periodic sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::types::DecisionEffect;

/// Default retention window for audit records
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Kind of event an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// An authorization decision was made
    Authorization,
    /// An administrative operation ran
    AdminAction,
    /// A policy was created, updated, published, or archived
    PolicyChange,
    /// A role was granted or revoked
    RoleAssignment,
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID
    pub id: Uuid,

    /// Tenant the event belongs to
    pub organization_id: String,

    pub event_type: AuditEventType,

    pub timestamp: DateTime<Utc>,

    /// Who performed the action, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,

    pub resource_type: String,

    pub resource_id: String,

    /// Action performed or requested
    pub action: String,

    /// Decision outcome, authorization events only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionEffect>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Opaque request payload for investigation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
}

impl AuditRecord {
    fn base(
        organization_id: impl Into<String>,
        event_type: AuditEventType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            event_type,
            timestamp: Utc::now(),
            actor_id: None,
            actor_email: None,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            decision: None,
            decision_reason: None,
            ip_address: None,
            user_agent: None,
            request_data: None,
            response_data: None,
        }
    }

    /// Record an authorization decision
    pub fn authorization(
        organization_id: impl Into<String>,
        principal_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        effect: DecisionEffect,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::base(
            organization_id,
            AuditEventType::Authorization,
            resource_type,
            resource_id,
            action,
        );
        record.actor_id = Some(principal_id.into());
        record.decision = Some(effect);
        record.decision_reason = Some(reason.into());
        record
    }

    /// Record a policy lifecycle change
    pub fn policy_change(
        organization_id: impl Into<String>,
        action: impl Into<String>,
        policy_id: &Uuid,
        policy_name: &str,
    ) -> Self {
        Self::base(
            organization_id,
            AuditEventType::PolicyChange,
            "policy",
            policy_id.to_string(),
            action,
        )
        .with_request_data(serde_json::json!({ "policy_name": policy_name }))
    }

    /// Record a role grant or revocation
    pub fn role_assignment(
        organization_id: impl Into<String>,
        action: impl Into<String>,
        user_id: &Uuid,
        role_id: &Uuid,
    ) -> Self {
        Self::base(
            organization_id,
            AuditEventType::RoleAssignment,
            "role",
            role_id.to_string(),
            action,
        )
        .with_request_data(serde_json::json!({ "user_id": user_id.to_string() }))
    }

    /// Record a general administrative operation
    pub fn admin_action(
        organization_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::base(
            organization_id,
            AuditEventType::AdminAction,
            resource_type,
            resource_id,
            action,
        )
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_actor_email(mut self, email: impl Into<String>) -> Self {
        self.actor_email = Some(email.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_request_data(mut self, data: serde_json::Value) -> Self {
        self.request_data = Some(data);
        self
    }

    pub fn with_response_data(mut self, data: serde_json::Value) -> Self {
        self.response_data = Some(data);
        self
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record
    async fn write(&self, record: AuditRecord) -> Result<()>;

    /// Remove records older than the cutoff, returning how many were removed.
    /// Sinks without retention support keep everything.
    async fn prune_older_than(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory audit sink with query helpers
pub struct InMemoryAuditSink {
    records: Arc<tokio::sync::RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            records: Arc::new(tokio::sync::RwLock::new(Vec::new())),
        }
    }

    /// All retained records, oldest first
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    /// Most recent records for one organization
    pub async fn for_organization(&self, organization_id: &str, limit: usize) -> Vec<AuditRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| r.organization_id == organization_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push(record);
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok(before - records.len())
    }
}

/// Non-blocking front of the audit pipeline.
///
/// Shared via `Arc` between the engine and the policy registry. Dropping a
/// record is preferred over stalling a decision.
pub struct AuditWriter {
    tx: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    dropped: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditWriter {
    /// Start the background worker draining into the sink
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.write(record).await {
                    warn!(error = %e, "failed to persist audit record");
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a record without blocking. Returns false when the record was
    /// dropped because the queue is full or the writer is shut down.
    pub fn record(&self, record: AuditRecord) -> bool {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit writer shut down, dropping record");
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("audit queue full, dropping record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("audit channel closed, dropping record");
                false
            }
        }
    }

    /// Records dropped since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for the worker to drain the queue
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "audit worker terminated abnormally");
            }
        }
    }
}

/// Periodically prune records older than the retention window
pub fn spawn_retention_sweep(
    sink: Arc<dyn AuditSink>,
    retention: chrono::Duration,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - retention;
            match sink.prune_older_than(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "audit retention sweep pruned records"),
                Err(e) => warn!(error = %e, "audit retention sweep failed"),
            }
        }
    })
}
