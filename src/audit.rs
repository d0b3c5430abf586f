//! Structured audit trail for material ride actions.
//!
//! One JSON record per action: timestamp, actor, action, resource, outcome.
//! Sinks are pluggable: stdout for the server, in-memory for tests.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::types::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RideCreate,
    BidSubmit,
    BidAccept,
    RideStart,
    RideComplete,
    RideCancel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Rejected by a guard; carries the error code.
    Rejected(&'static str),
    /// Fatal consistency fault.
    Error(String),
}

impl AuditOutcome {
    pub fn from_result<T>(result: &Result<T, DispatchError>) -> Self {
        match result {
            Ok(_) => AuditOutcome::Success,
            Err(DispatchError::InvariantViolation(msg)) => AuditOutcome::Error(msg.clone()),
            Err(e) => AuditOutcome::Rejected(e.code()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp: Timestamp,
    /// User id of the caller, or "system" for timer-driven actions.
    pub actor: String,
    pub action: AuditAction,
    /// Ride / bid identifiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    pub fn new(
        timestamp: Timestamp,
        actor: impl Into<String>,
        action: AuditAction,
        resource: Option<serde_json::Value>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp,
            actor: actor.into(),
            action,
            resource,
            outcome,
        }
    }
}

pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: &AuditEvent);
}

/// One JSON line per event on stdout.
#[derive(Debug, Default)]
pub struct StdoutAuditSink;

impl AuditSink for StdoutAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

/// Keeps events in memory. Clone shares the same buffer.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events.lock().iter().map(|e| e.action).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
