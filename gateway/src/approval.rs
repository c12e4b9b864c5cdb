use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// What the suspended handler learns when its wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("approval request already resolved: {0}")]
    AlreadyResolved(String),
    #[error("approval wait cancelled")]
    Cancelled,
}

/// Facts about a suspended request, captured for the operator.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub agent_id: String,
    pub content_type: Option<String>,
    pub summary: String,
    pub body: Option<String>,
}

/// Snapshot of an unresolved record, as listed to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

struct PendingRecord {
    info: PendingApproval,
    // Taken on resolution; a taken resolver marks the record terminal.
    resolver: Option<oneshot::Sender<bool>>,
}

struct RecordGuard<'a> {
    broker: &'a ApprovalBroker,
    id: String,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.broker.records.lock().remove(&self.id);
    }
}

/// Registry of suspended requests awaiting a human decision.
///
/// One mutex guards the id->record map; each record carries a one-shot
/// resolver. Resolution releases the registry lock before firing the
/// resolver so a resolution visible to `list_pending` is also visible to the
/// suspended handler.
pub struct ApprovalBroker {
    records: Mutex<HashMap<String, PendingRecord>>,
    timeout: Duration,
}

impl ApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register the request and suspend until an operator resolves it, the
    /// deadline passes, or the caller goes away. Terminal either way: the
    /// record is removed before this returns.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let id = Uuid::new_v4().to_string();
        let (resolver, resolved) = oneshot::channel();
        let created_at = Utc::now();
        let deadline = created_at
            + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::seconds(300));

        {
            let mut records = self.records.lock();
            records.insert(
                id.clone(),
                PendingRecord {
                    info: PendingApproval {
                        id: id.clone(),
                        endpoint: request.endpoint,
                        method: request.method,
                        path: request.path,
                        agent_id: request.agent_id,
                        content_type: request.content_type,
                        summary: request.summary,
                        body: request.body,
                        created_at,
                        deadline,
                    },
                    resolver: Some(resolver),
                },
            );
        }
        info!(approval_id = %id, "request suspended awaiting approval");
        // Evicts the record even when the caller's future is dropped
        // mid-wait (agent disconnect).
        let _guard = RecordGuard { broker: self, id };

        tokio::select! {
            resolution = resolved => match resolution {
                Ok(true) => Ok(ApprovalOutcome::Approved),
                Ok(false) => Ok(ApprovalOutcome::Denied),
                // Registry dropped out from under us; treat as denial.
                Err(_) => Ok(ApprovalOutcome::Denied),
            },
            () = tokio::time::sleep(self.timeout) => Ok(ApprovalOutcome::TimedOut),
            () = cancel.cancelled() => Err(ApprovalError::Cancelled),
        }
    }

    /// Unresolved records, oldest first.
    pub fn list_pending(&self) -> Vec<PendingApproval> {
        let records = self.records.lock();
        let mut pending: Vec<PendingApproval> = records
            .values()
            .filter(|record| record.resolver.is_some())
            .map(|record| record.info.clone())
            .collect();
        pending.sort_by_key(|record| record.created_at);
        pending
    }

    pub fn approve(&self, id: &str) -> Result<(), ApprovalError> {
        self.resolve(id, true)
    }

    pub fn deny(&self, id: &str) -> Result<(), ApprovalError> {
        self.resolve(id, false)
    }

    fn resolve(&self, id: &str, approved: bool) -> Result<(), ApprovalError> {
        let resolver = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            record
                .resolver
                .take()
                .ok_or_else(|| ApprovalError::AlreadyResolved(id.to_string()))?
        };
        // Lock released above; the send happens-after the registry update.
        let _ = resolver.send(approved);
        info!(approval_id = %id, approved, "approval resolved");
        Ok(())
    }
}
