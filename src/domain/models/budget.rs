//! Daily spend records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single recorded spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendEvent {
    pub ts: DateTime<Utc>,
    pub job_id: String,
    pub amount_usd: f64,
}

/// Budget document, one global and one per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub date: NaiveDate,
    pub daily_limit_usd: f64,
    #[serde(default)]
    pub spent_today_usd: f64,
    #[serde(default)]
    pub events: Vec<SpendEvent>,
}

impl BudgetRecord {
    pub fn new(date: NaiveDate, daily_limit_usd: f64) -> Self {
        Self {
            date,
            daily_limit_usd,
            spent_today_usd: 0.0,
            events: Vec::new(),
        }
    }

    /// Reset the day's spend when `today` differs from the stored date.
    ///
    /// Returns true if the record rolled over. The limit is preserved.
    pub fn rotate(&mut self, today: NaiveDate) -> bool {
        if self.date == today {
            return false;
        }
        self.date = today;
        self.spent_today_usd = 0.0;
        self.events.clear();
        true
    }

    /// Whether `additional` fits within the limit. A non-positive limit denies everything.
    pub fn allows(&self, additional: f64) -> bool {
        if self.daily_limit_usd <= 0.0 {
            return false;
        }
        self.spent_today_usd + additional.max(0.0) <= self.daily_limit_usd
    }

    pub fn remaining(&self) -> f64 {
        (self.daily_limit_usd - self.spent_today_usd).max(0.0)
    }

    /// Record spend. Negative amounts are ignored so spend never decreases intra-day.
    pub fn record(&mut self, job_id: impl Into<String>, amount_usd: f64) {
        let amount = amount_usd.max(0.0);
        self.spent_today_usd += amount;
        self.events.push(SpendEvent {
            ts: Utc::now(),
            job_id: job_id.into(),
            amount_usd: amount,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_zero_limit_fails_closed() {
        let record = BudgetRecord::new(day(1), 0.0);
        assert!(!record.allows(0.0));
        assert!(!record.allows(0.01));
    }

    #[test]
    fn test_allows_up_to_limit() {
        let mut record = BudgetRecord::new(day(1), 5.0);
        record.record("a", 4.0);
        assert!(record.allows(1.0));
        assert!(!record.allows(1.01));
        assert!((record.remaining() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rotation_preserves_limit() {
        let mut record = BudgetRecord::new(day(1), 7.5);
        record.record("a", 3.0);

        assert!(!record.rotate(day(1)));
        assert!((record.spent_today_usd - 3.0).abs() < f64::EPSILON);

        assert!(record.rotate(day(2)));
        assert_eq!(record.spent_today_usd, 0.0);
        assert!((record.daily_limit_usd - 7.5).abs() < f64::EPSILON);
        assert!(record.events.is_empty());
    }

    #[test]
    fn test_negative_spend_ignored() {
        let mut record = BudgetRecord::new(day(1), 5.0);
        record.record("a", 2.0);
        record.record("b", -1.0);
        assert!((record.spent_today_usd - 2.0).abs() < f64::EPSILON);
    }
}
