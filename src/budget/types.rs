//! Budget and alert types.

use crate::model::BillingPeriod;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a budget applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetScope {
    /// All usage of an organization
    Organization {
        /// Organization
        organization_id: String,
    },
    /// Usage of one project
    Project {
        /// Owning organization
        organization_id: String,
        /// Project
        project_id: String,
    },
}

impl BudgetScope {
    /// Organization scope.
    pub fn organization(organization_id: impl Into<String>) -> Self {
        BudgetScope::Organization {
            organization_id: organization_id.into(),
        }
    }

    /// Project scope.
    pub fn project(organization_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        BudgetScope::Project {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Scopes affected by usage of an organization and optional project.
    pub fn affected(organization_id: &str, project_id: Option<&str>) -> Vec<BudgetScope> {
        let mut scopes = vec![BudgetScope::organization(organization_id)];
        if let Some(project_id) = project_id {
            scopes.push(BudgetScope::project(organization_id, project_id));
        }
        scopes
    }

    /// Owning organization.
    pub fn organization_id(&self) -> &str {
        match self {
            BudgetScope::Organization { organization_id } => organization_id,
            BudgetScope::Project { organization_id, .. } => organization_id,
        }
    }

    /// Project, if project scoped.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            BudgetScope::Organization { .. } => None,
            BudgetScope::Project { project_id, .. } => Some(project_id),
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Organization { organization_id } => write!(f, "{}", organization_id),
            BudgetScope::Project {
                organization_id,
                project_id,
            } => write!(f, "{}/{}", organization_id, project_id),
        }
    }
}

/// A budgeted usage dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetDimension {
    /// Trace spans
    Spans,
    /// Payload bytes
    Bytes,
    /// Evaluation scores
    Scores,
    /// Billed cost
    Cost,
}

impl BudgetDimension {
    /// All dimensions in evaluation order.
    pub const ALL: [BudgetDimension; 4] = [
        BudgetDimension::Spans,
        BudgetDimension::Bytes,
        BudgetDimension::Scores,
        BudgetDimension::Cost,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::Spans => "spans",
            BudgetDimension::Bytes => "bytes",
            BudgetDimension::Scores => "scores",
            BudgetDimension::Cost => "cost",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-dimension limits. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Span limit
    pub spans: Option<u64>,
    /// Byte limit
    pub bytes: Option<u64>,
    /// Score limit
    pub scores: Option<u64>,
    /// Cost limit
    pub cost: Option<Decimal>,
}

impl BudgetLimits {
    /// Limit of a dimension.
    pub fn limit(&self, dimension: BudgetDimension) -> Option<Decimal> {
        match dimension {
            BudgetDimension::Spans => self.spans.map(Decimal::from),
            BudgetDimension::Bytes => self.bytes.map(Decimal::from),
            BudgetDimension::Scores => self.scores.map(Decimal::from),
            BudgetDimension::Cost => self.cost,
        }
    }

    /// Validate the limits.
    pub fn validate(&self) -> Result<()> {
        let limits: Vec<Decimal> = BudgetDimension::ALL
            .iter()
            .filter_map(|d| self.limit(*d))
            .collect();
        if limits.is_empty() {
            return Err(Error::validation_field(
                "a budget needs at least one limit",
                "limits",
            ));
        }
        if limits.iter().any(|l| *l <= Decimal::ZERO) {
            return Err(Error::validation_field("budget limits must be positive", "limits"));
        }
        Ok(())
    }
}

/// Period-to-date usage of a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Spans
    pub spans: u64,
    /// Bytes
    pub bytes: u64,
    /// Scores
    pub scores: u64,
    /// Cost
    pub cost: Decimal,
}

impl UsageSnapshot {
    /// Usage of a dimension.
    pub fn value(&self, dimension: BudgetDimension) -> Decimal {
        match dimension {
            BudgetDimension::Spans => Decimal::from(self.spans),
            BudgetDimension::Bytes => Decimal::from(self.bytes),
            BudgetDimension::Scores => Decimal::from(self.scores),
            BudgetDimension::Cost => self.cost,
        }
    }

    /// Add another snapshot.
    pub fn add(&mut self, other: &UsageSnapshot) {
        self.spans = self.spans.saturating_add(other.spans);
        self.bytes = self.bytes.saturating_add(other.bytes);
        self.scores = self.scores.saturating_add(other.scores);
        self.cost += other.cost;
    }

    /// Whether nothing was consumed.
    pub fn is_empty(&self) -> bool {
        self.spans == 0 && self.bytes == 0 && self.scores == 0 && self.cost.is_zero()
    }
}

/// A user-defined usage budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBudget {
    /// Budget ID
    pub id: String,
    /// Display name
    pub name: String,
    /// What the budget covers
    pub scope: BudgetScope,
    /// Limits
    pub limits: BudgetLimits,
    /// Alert thresholds in percent, ascending and unique
    pub thresholds: Vec<Decimal>,
    /// Inactive budgets are never evaluated
    pub active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// Request to create a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBudget {
    /// Display name
    pub name: String,
    /// What the budget covers
    pub scope: BudgetScope,
    /// Limits
    pub limits: BudgetLimits,
    /// Thresholds; configured defaults apply when absent
    #[serde(default)]
    pub thresholds: Option<Vec<Decimal>>,
}

/// Partial budget update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetUpdate {
    /// New name
    pub name: Option<String>,
    /// New limits
    pub limits: Option<BudgetLimits>,
    /// New thresholds
    pub thresholds: Option<Vec<Decimal>>,
    /// Reactivate or deactivate
    pub active: Option<bool>,
}

/// Sort and deduplicate thresholds, rejecting non-positive ones.
pub fn normalize_thresholds(mut thresholds: Vec<Decimal>) -> Result<Vec<Decimal>> {
    if thresholds.is_empty() {
        return Err(Error::validation_field(
            "at least one alert threshold is required",
            "thresholds",
        ));
    }
    if thresholds.iter().any(|t| *t <= Decimal::ZERO) {
        return Err(Error::validation_field(
            "alert thresholds must be positive percentages",
            "thresholds",
        ));
    }
    thresholds.sort();
    thresholds.dedup();
    Ok(thresholds)
}

/// A fired threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAlert {
    /// Alert ID
    pub id: String,
    /// Budget that fired
    pub budget_id: String,
    /// Budget name at firing time
    pub budget_name: String,
    /// Scope of the budget
    pub scope: BudgetScope,
    /// Threshold crossed, in percent
    pub threshold: Decimal,
    /// Dimension with the highest consumption at firing time
    pub dimension: BudgetDimension,
    /// Usage of that dimension
    pub usage: Decimal,
    /// Limit of that dimension
    pub limit: Decimal,
    /// Usage as a percentage of the limit
    pub percent: Decimal,
    /// Billing period the crossing belongs to
    pub period: BillingPeriod,
    /// Firing time
    pub created_at: DateTime<Utc>,
    /// Whether someone acknowledged it
    pub acknowledged: bool,
    /// Acknowledgment time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Who acknowledged it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
}

impl UsageAlert {
    /// Key enforcing one alert per budget, threshold and period.
    pub fn dedup_key(&self) -> (String, Decimal, String) {
        (
            self.budget_id.clone(),
            self.threshold.normalize(),
            self.period.key(),
        )
    }

    /// Owning organization.
    pub fn organization_id(&self) -> &str {
        self.scope.organization_id()
    }
}

/// Alert listing filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    /// Only alerts of this budget
    pub budget_id: Option<String>,
    /// Only acknowledged or only pending alerts
    pub acknowledged: Option<bool>,
}

impl AlertFilter {
    /// Whether an alert passes the filter.
    pub fn matches(&self, alert: &UsageAlert) -> bool {
        if matches!(&self.budget_id, Some(id) if *id != alert.budget_id) {
            return false;
        }
        if matches!(self.acknowledged, Some(ack) if ack != alert.acknowledged) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_thresholds() {
        let t = normalize_thresholds(vec![dec!(100), dec!(50), dec!(80), dec!(50.0)]).unwrap();
        assert_eq!(t, vec![dec!(50), dec!(80), dec!(100)]);

        assert!(normalize_thresholds(vec![]).is_err());
        assert!(normalize_thresholds(vec![dec!(0)]).is_err());
    }

    #[test]
    fn test_limits_validation() {
        assert!(BudgetLimits::default().validate().is_err());
        assert!(BudgetLimits {
            cost: Some(dec!(0)),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BudgetLimits {
            spans: Some(1_000),
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_affected_scopes() {
        assert_eq!(BudgetScope::affected("org", None).len(), 1);
        let scopes = BudgetScope::affected("org", Some("proj"));
        assert_eq!(scopes[1], BudgetScope::project("org", "proj"));
        assert_eq!(scopes[1].to_string(), "org/proj");
    }

    #[test]
    fn test_snapshot_add() {
        let mut total = UsageSnapshot::default();
        assert!(total.is_empty());
        total.add(&UsageSnapshot {
            spans: 2,
            cost: dec!(0.5),
            ..Default::default()
        });
        total.add(&UsageSnapshot {
            spans: 1,
            cost: dec!(0.25),
            ..Default::default()
        });
        assert_eq!(total.value(BudgetDimension::Spans), dec!(3));
        assert_eq!(total.value(BudgetDimension::Cost), dec!(0.75));
    }
}
