//! Error types for meterboard-core
//!
//! One enum for every failure the core can report, grouped by how callers
//! are expected to react (propagate, skip the item, log a business event,
//! count a persistence failure, or raise a consistency alarm).

use crate::models::{NodeId, PlanId, SubscriberId};
use rusqlite::ffi::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for meterboard operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // Lookup Errors
    // ===================
    #[error("Subscriber not found: {subscriber_id}")]
    SubscriberNotFound { subscriber_id: SubscriberId },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: NodeId },

    #[error("Plan not found: {plan_id}")]
    PlanNotFound { plan_id: PlanId },

    // ===================
    // Input Errors
    // ===================
    #[error("Malformed traffic batch: {message}")]
    MalformedBatch { message: String },

    // ===================
    // Eligibility
    // ===================
    #[error("Subscriber {subscriber_id} is banned")]
    SubscriberBanned { subscriber_id: SubscriberId },

    #[error("Subscriber {subscriber_id} has no plan")]
    NoPlan { subscriber_id: SubscriberId },

    // ===================
    // Store Errors
    // ===================
    #[error("Database error during {operation}")]
    Database {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Lock acquisition timeout")]
    LockTimeout,

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },

    // ===================
    // Consistency
    // ===================
    #[error("Invalid multiplier {value} for subscriber {subscriber_id} on node {node_id}")]
    InvalidMultiplier {
        subscriber_id: SubscriberId,
        node_id: NodeId,
        value: f64,
    },

    #[error("Consistency invariant violated: {message}")]
    InvariantViolation { message: String },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// How a failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Subscriber, node or plan missing; propagate, never retry
    NotFound,
    /// Unparsable input; drop the item, continue the batch
    MalformedInput,
    /// Banned or plan-less subscriber; a business event, not a fault
    Ineligible,
    /// Transaction failed or timed out; the item is unapplied
    Persistence,
    /// Data contradicts a structural guarantee; alarm, never retry
    Invariant,
    Config,
}

impl CoreError {
    /// Wrap a rusqlite error with the operation that produced it
    pub fn db(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> CoreError {
        move |source| CoreError::Database { operation, source }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        CoreError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::SubscriberNotFound { .. }
            | CoreError::NodeNotFound { .. }
            | CoreError::PlanNotFound { .. } => ErrorCategory::NotFound,
            CoreError::MalformedBatch { .. } => ErrorCategory::MalformedInput,
            CoreError::SubscriberBanned { .. } | CoreError::NoPlan { .. } => {
                ErrorCategory::Ineligible
            }
            CoreError::Database { .. }
            | CoreError::LockTimeout
            | CoreError::Timeout { .. }
            | CoreError::TaskFailed { .. } => ErrorCategory::Persistence,
            CoreError::InvalidMultiplier { .. } | CoreError::InvariantViolation { .. } => {
                ErrorCategory::Invariant
            }
            CoreError::InvalidConfig { .. } => ErrorCategory::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// True when SQLite gave up because of the transaction deadline or lock contention
    pub fn is_sqlite_timeout(&self) -> bool {
        match self {
            CoreError::Database { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(ErrorCode::OperationInterrupted)
                    | Some(ErrorCode::DatabaseBusy)
                    | Some(ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// True when SQLite rejected a write because of a UNIQUE constraint
    pub fn is_unique_violation(&self) -> bool {
        match self {
            CoreError::Database {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE,
            _ => false,
        }
    }
}

/// Severity of a per-item issue recorded while processing a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Item dropped as expected (malformed, ineligible)
    Notice,
    /// Item failed to apply and is lost until the node resends
    Error,
    /// Consistency alarm
    Fatal,
}

/// Individual problem entry in an ingest outcome
#[derive(Debug, Clone)]
pub struct IngestIssue {
    pub source: String,
    pub subscriber_id: Option<SubscriberId>,
    pub message: String,
    pub severity: IssueSeverity,
}

impl IngestIssue {
    pub fn notice(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            subscriber_id: None,
            message: message.into(),
            severity: IssueSeverity::Notice,
        }
    }

    pub fn from_core_error(subscriber_id: SubscriberId, error: &CoreError) -> Self {
        let (source, severity) = match error.category() {
            ErrorCategory::Ineligible => ("eligibility", IssueSeverity::Notice),
            ErrorCategory::MalformedInput => ("normalize", IssueSeverity::Notice),
            ErrorCategory::Invariant => ("consistency", IssueSeverity::Fatal),
            ErrorCategory::NotFound => ("lookup", IssueSeverity::Error),
            ErrorCategory::Persistence | ErrorCategory::Config => {
                ("persistence", IssueSeverity::Error)
            }
        };

        Self {
            source: source.to_string(),
            subscriber_id: Some(subscriber_id),
            message: error.to_string(),
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            CoreError::SubscriberNotFound { subscriber_id: 1 }.category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            CoreError::NoPlan { subscriber_id: 1 }.category(),
            ErrorCategory::Ineligible
        );
        assert_eq!(CoreError::LockTimeout.category(), ErrorCategory::Persistence);
        assert_eq!(
            CoreError::invariant("two current periods").category(),
            ErrorCategory::Invariant
        );
        assert!(CoreError::NodeNotFound { node_id: 3 }.is_not_found());
    }

    #[test]
    fn test_issue_severity_follows_category() {
        let banned = IngestIssue::from_core_error(
            9,
            &CoreError::SubscriberBanned { subscriber_id: 9 },
        );
        assert_eq!(banned.severity, IssueSeverity::Notice);
        assert_eq!(banned.subscriber_id, Some(9));

        let alarm = IngestIssue::from_core_error(9, &CoreError::invariant("dup"));
        assert_eq!(alarm.severity, IssueSeverity::Fatal);
        assert_eq!(alarm.source, "consistency");
    }
}
