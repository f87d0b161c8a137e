//! Audit trail for security and compliance relevant actions.
//!
//! Durable storage of audit records is an external concern; this module
//! defines the event shape and the [`AuditSink`] seam. Sinks must not fail
//! the request they describe: errors are logged and dropped by
//! [`record`].

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// What happened, e.g. `chat` or `rate_limit`.
    pub action: String,
    /// Client key of the caller.
    pub actor: String,
    /// What was acted on, e.g. `prompt:eye_chat@1.0.0`.
    pub resource: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            action: action.into(),
            actor: actor.into(),
            resource: resource.into(),
            outcome,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Hand `event` to `sink`, logging instead of propagating a failure.
pub async fn record(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        tracing::warn!(
            action = %event.action,
            error = %e,
            "audit sink failed, event dropped"
        );
    }
}

/// Emits each event as a structured `tracing` record with target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        tracing::info!(
            target: "audit",
            action = %event.action,
            actor = %event.actor,
            resource = %event.resource,
            outcome = event.outcome.as_str(),
            detail = event.detail.as_deref().unwrap_or(""),
            at = %event.at.to_rfc3339(),
            "audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory. Used by tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        Ok(())
    }
}
