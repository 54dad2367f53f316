//! Errors raised by ingestion, quota, budget, billing and analytics calls.
//!
//! Quota denials are not errors. They come back as a
//! [`QuotaStatus`](crate::quota::QuotaStatus) and the gateway picks between
//! warning and blocking.

use thiserror::Error;

/// Shorthand for results carrying the metering [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine reports to its caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before it reached any buffer or store
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input
        message: String,
        /// Offending field of the metric, plan or budget
        field: Option<String>,
    },

    /// Resource does not exist in the caller's organization
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource (budget, alert, invoice, ...)
        resource: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// A state transition that would move a document backwards
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Entity whose state machine refused the transition
        entity: &'static str,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The ingestion worker is not accepting records
    #[error("Analytics worker is not running")]
    NotRunning,

    /// Settings that failed to load or validate
    #[error("Invalid configuration: {message}")]
    Config {
        /// Problem with the value
        message: String,
        /// Dotted key such as `ingestion.batch_size`
        key: Option<String>,
    },

    /// Backing store failure (repository, ledger, counters)
    #[error("Storage error: {message}")]
    Storage {
        /// Store-reported failure
        message: String,
    },

    /// Outbound call (alert webhook and similar) failed
    #[error("{service} call failed: {message}")]
    Integration {
        /// Receiving service
        service: String,
        /// Transport error or response status
        message: String,
    },

    /// A bounded wait ran out, e.g. the final flush on shutdown
    #[error("{message} did not finish within {duration_ms}ms")]
    Timeout {
        /// Operation that was waited on
        message: String,
        /// Bound that expired
        duration_ms: u64,
    },

    /// Reading a config file or writing an export
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON export or webhook payload encoding
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pricing or discount tables in YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Broken invariant inside the engine
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the broken state
        message: String,
    },
}

impl Error {
    /// Input rejected without naming a field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Input rejected because of `field`.
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a not-found error.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Create an invalid-transition error.
    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Error::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Configuration problem not tied to one key (usually a loader error).
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), key: None }
    }

    /// Configuration problem at `key`.
    pub fn config_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Config { message: message.into(), key: Some(key.into()) }
    }

    /// Store failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Outbound call to `service` failed.
    pub fn integration(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integration { service: service.into(), message: message.into() }
    }

    /// `operation` exceeded its `duration_ms` bound.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout { message: operation.into(), duration_ms }
    }

    /// Unexpected engine state.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying the same call later can succeed.
    ///
    /// True only for downstream sink failures. Everything else needs
    /// different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Integration { .. } | Error::Timeout { .. }
        )
    }

    /// Label used for the `errors` counter and rejection metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NotRunning => "not_running",
            Error::Config { .. } => "config",
            Error::Storage { .. } => "storage",
            Error::Integration { .. } => "integration",
            Error::Timeout { .. } => "timeout",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Yaml(_) => "yaml",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::config(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::internal(format!("CSV export failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_field() {
        let err = Error::validation_field("input tokens out of range", "input_tokens");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("input_tokens")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("final flush", 5000);
        assert_eq!(err.to_string(), "final flush did not finish within 5000ms");
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::storage("disk full").is_recoverable());
        assert!(Error::integration("webhook", "unavailable").is_recoverable());
        assert!(Error::timeout("flush", 5000).is_recoverable());
        assert!(!Error::validation("empty organization").is_recoverable());
        assert!(!Error::NotRunning.is_recoverable());
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("alert", "a-1");
        assert_eq!(err.to_string(), "alert not found: a-1");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::invalid_transition("invoice", "paid", "draft");
        assert!(err.to_string().contains("paid to draft"));
        assert_eq!(err.category(), "invalid_transition");
    }
}
