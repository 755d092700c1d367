//! Audit trail for migration state changes.
//!
//! Every batch and instance state change produces one [`AuditRecord`],
//! emitted as structured JSON on the `audit` tracing target so operators can
//! reconstruct what the engine did to a VM and when.
//!
//! | Outcome | Level |
//! |---------|-------|
//! | Success | info |
//! | InProgress | debug |
//! | Failure / Denied | warn |
//!
//! Rejected worker tokens are logged with [`security_audit!`] on the
//! `security_audit` target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Batch create/start/stop/reset/finish
    BatchLifecycle,
    /// Membership changes of an instance
    BatchMembership,
    /// Placement and restriction decisions
    Placement,
    /// Target VM creation
    Provisioning,
    /// Commands and reports exchanged with workers
    WorkerProtocol,
    /// Post-migration reconfiguration
    Finalization,
    /// Catalog reconciliation against the source
    InventorySync,
    /// Token checks of worker requests
    Authentication,
    /// Daemon startup and shutdown
    SystemLifecycle,
    /// Error and failure events
    ErrorCondition,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::BatchLifecycle => write!(f, "BATCH_LIFECYCLE"),
            AuditCategory::BatchMembership => write!(f, "BATCH_MEMBERSHIP"),
            AuditCategory::Placement => write!(f, "PLACEMENT"),
            AuditCategory::Provisioning => write!(f, "PROVISIONING"),
            AuditCategory::WorkerProtocol => write!(f, "WORKER_PROTOCOL"),
            AuditCategory::Finalization => write!(f, "FINALIZATION"),
            AuditCategory::InventorySync => write!(f, "INVENTORY_SYNC"),
            AuditCategory::Authentication => write!(f, "AUTHENTICATION"),
            AuditCategory::SystemLifecycle => write!(f, "SYSTEM_LIFECYCLE"),
            AuditCategory::ErrorCondition => write!(f, "ERROR_CONDITION"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audit event, built with the `with_*` methods and emitted with
/// [`audit_log!`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that performed the action.
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// "batch", "instance", "network", ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Batch the event belongs to, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
}

impl AuditRecord {
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
            batch: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Records an error; the outcome becomes `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn with_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target at a level chosen by its outcome.
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure | $crate::audit::AuditOutcome::Denied => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Emits a security-relevant [`AuditRecord`] on the `security_audit` target.
#[macro_export]
macro_rules! security_audit {
    ($record:expr) => {
        let record = $record;
        tracing::warn!(
            target: "security_audit",
            category = %record.category,
            source = %record.source,
            action = %record.action,
            outcome = %record.outcome,
            error = record.error.as_deref().unwrap_or(""),
            audit_json = %record.to_json(),
            "SECURITY_AUDIT: {} - {} - {}",
            record.category,
            record.action,
            record.outcome
        );
    };
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. With `json` set, every
/// event is written as one JSON object per line.
pub fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display_matches_serde() {
        let json = serde_json::to_string(&AuditCategory::BatchLifecycle).unwrap();
        assert_eq!(json, "\"BATCH_LIFECYCLE\"");
        assert_eq!(AuditCategory::BatchLifecycle.to_string(), "BATCH_LIFECYCLE");
    }

    #[test]
    fn test_with_error_sets_failure() {
        let record = AuditRecord::new(AuditCategory::Provisioning, "Provisioner", "create_vm")
            .with_outcome(AuditOutcome::Success)
            .with_error("start failed");
        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("start failed"));
    }

    #[test]
    fn test_to_json_skips_empty_fields() {
        let record = AuditRecord::new(AuditCategory::BatchLifecycle, "BatchManager", "start")
            .with_object_id("wave-1")
            .with_object_type("batch");
        let value: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(value["object_id"], "wave-1");
        assert_eq!(value["outcome"], "in_progress");
        assert!(value.get("error").is_none());
        assert!(value.get("batch").is_none());
    }

    #[test]
    fn test_audit_macros_expand() {
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "test", "noop")
            .with_outcome(AuditOutcome::Success));
        security_audit!(AuditRecord::new(AuditCategory::Authentication, "test", "token")
            .with_outcome(AuditOutcome::Denied));
    }
}
