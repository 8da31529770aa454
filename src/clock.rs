use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Abstraction over "current time" so reconciliation behavior is
/// deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Noon UTC on the given date; convenient for date-driven tests.
    pub fn on_date(date: NaiveDate) -> Self {
        Self {
            now: date.and_hms_opt(12, 0, 0).expect("valid time").and_utc(),
        }
    }

    pub fn advanced_by(&self, days: i64) -> Self {
        Self {
            now: self.now + Duration::days(days),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
