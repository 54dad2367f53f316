//! Billing periods and query ranges.

use crate::{Error, Result};

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range, rejecting empty or inverted ones.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::validation_field(
                format!("range end {} is not after start {}", end, start),
                "range",
            ));
        }
        Ok(Self { start, end })
    }

    /// The range covering the last `duration` up to now.
    pub fn last(duration: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - duration,
            end,
        }
    }

    /// Whether the instant falls inside the range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// A monthly billing window `[start, end)`.
///
/// Periods are either calendar months or, when the account has a billing
/// anchor, months counted from the anchor instant. An anchor on the 31st
/// yields a period starting on the last day of shorter months; the next
/// period is always computed from the anchor itself so the day drifts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// Anchor the period was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<DateTime<Utc>>,
}

impl BillingPeriod {
    /// The period containing `at`.
    pub fn containing(at: DateTime<Utc>, anchor: Option<DateTime<Utc>>) -> Self {
        let base = anchor.unwrap_or_else(calendar_anchor);

        let mut months = (at.year() - base.year()) * 12 + at.month() as i32 - base.month() as i32;
        if shift_months(base, months) > at {
            months -= 1;
        } else if shift_months(base, months + 1) <= at {
            months += 1;
        }

        Self {
            start: shift_months(base, months),
            end: shift_months(base, months + 1),
            anchor,
        }
    }

    /// The calendar month containing `at`.
    pub fn calendar_month(at: DateTime<Utc>) -> Self {
        Self::containing(at, None)
    }

    /// The period following this one.
    pub fn next(&self) -> Self {
        Self::containing(self.end, self.anchor)
    }

    /// The period preceding this one.
    pub fn previous(&self) -> Self {
        Self::containing(self.start - Duration::seconds(1), self.anchor)
    }

    /// Whether the instant falls inside the period.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Whether the period ended at or before `now`.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// Stable key used to deduplicate per-period records.
    pub fn key(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// The period as a query range.
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

fn calendar_anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn shift_months(base: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let shifted = if months >= 0 {
        base.checked_add_months(Months::new(months as u32))
    } else {
        base.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted.unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_calendar_month() {
        let period = BillingPeriod::calendar_month(at(2026, 10, 17, 12));
        assert_eq!(period.start, at(2026, 10, 1, 0));
        assert_eq!(period.end, at(2026, 11, 1, 0));
        assert!(period.contains(at(2026, 10, 31, 23)));
        assert!(!period.contains(at(2026, 11, 1, 0)));
    }

    #[test]
    fn test_boundary_instant_starts_new_period() {
        let period = BillingPeriod::calendar_month(at(2026, 11, 1, 0));
        assert_eq!(period.start, at(2026, 11, 1, 0));
    }

    #[test]
    fn test_anchored_period() {
        let anchor = Some(at(2025, 3, 15, 9));
        let period = BillingPeriod::containing(at(2026, 10, 10, 0), anchor);
        assert_eq!(period.start, at(2026, 9, 15, 9));
        assert_eq!(period.end, at(2026, 10, 15, 9));

        let period = BillingPeriod::containing(at(2026, 10, 15, 9), anchor);
        assert_eq!(period.start, at(2026, 10, 15, 9));
    }

    #[test]
    fn test_anchor_on_31st_clamps_and_recovers() {
        let anchor = Some(at(2026, 1, 31, 0));
        let feb = BillingPeriod::containing(at(2026, 3, 1, 0), anchor);
        assert_eq!(feb.start, at(2026, 2, 28, 0));
        assert_eq!(feb.end, at(2026, 3, 31, 0));
        assert_eq!(feb.next().start, at(2026, 3, 31, 0));
    }

    #[test]
    fn test_next_and_previous() {
        let period = BillingPeriod::calendar_month(at(2026, 12, 5, 0));
        assert_eq!(period.next().start, at(2027, 1, 1, 0));
        assert_eq!(period.previous().start, at(2026, 11, 1, 0));
    }

    #[test]
    fn test_time_range_rejects_inverted() {
        assert!(TimeRange::new(at(2026, 2, 1, 0), at(2026, 1, 1, 0)).is_err());
        assert!(TimeRange::new(at(2026, 1, 1, 0), at(2026, 2, 1, 0)).is_ok());
    }
}
