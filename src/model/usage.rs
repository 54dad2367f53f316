//! Usage events for budget dimensions.

use super::RequestMetric;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consumption of the non-monetary budget dimensions.
///
/// One event is derived from every request (one span plus its payload
/// bytes); collaborators may record further events directly, e.g. when
/// evaluation scores are attached to traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetric {
    /// Billed organization
    pub organization_id: String,
    /// Project within the organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Spans (traced operations)
    #[serde(default)]
    pub spans: u64,
    /// Payload bytes
    #[serde(default)]
    pub bytes: u64,
    /// Evaluation scores
    #[serde(default)]
    pub scores: u64,
    /// Request this event was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_request_id: Option<String>,
    /// Event time
    pub timestamp: DateTime<Utc>,
}

impl UsageMetric {
    /// Create an empty event for an organization.
    pub fn new(organization_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: None,
            spans: 0,
            bytes: 0,
            scores: 0,
            source_request_id: None,
            timestamp,
        }
    }

    /// Derive the usage event of a completed request.
    pub fn from_request(metric: &RequestMetric) -> Self {
        Self {
            organization_id: metric.organization_id.clone(),
            project_id: metric.project_id.clone(),
            spans: 1,
            bytes: metric.payload_bytes(),
            scores: 0,
            source_request_id: Some(metric.request_id.clone()),
            timestamp: metric.timestamp,
        }
    }

    /// Set the project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the span count.
    pub fn with_spans(mut self, spans: u64) -> Self {
        self.spans = spans;
        self
    }

    /// Set the byte count.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    /// Set the score count.
    pub fn with_scores(mut self, scores: u64) -> Self {
        self.scores = scores;
        self
    }

    /// Reject events that cannot be attributed or carry nothing.
    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(Error::validation_field(
                "organization ID is required",
                "organization_id",
            ));
        }
        if self.spans == 0 && self.bytes == 0 && self.scores == 0 {
            return Err(Error::validation("usage event carries no usage"));
        }
        Ok(())
    }
}
