//! Reconciliation of raw meter snapshots into daily consumption estimates.
//!
//! The provider's monthly-granularity API periodically returns stale,
//! reset, or late-arriving data, so every poll independently classifies
//! the reading before deriving a daily number. Data-quality problems never
//! surface as errors; they become a classified status on the result.

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::fetch::round3;
use crate::models::{
    DailySource, DailyStatus, Fluid, FluidResult, FluidSnapshot, FluidState, ValueStatus,
};
use crate::stats::{SeriesMetadata, StatPoint, StatisticsSink};

/// Tolerance for "the total went down" detection; provider totals carry
/// three decimals at most.
const EPSILON: f64 = 1e-6;

/// Tagged outcome of the daily-delta derivation, resolved before any
/// statistics side effects run.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DailyOutcome {
    /// No fresh data; optionally tagged with why the total was substituted.
    Stale { source: Option<DailySource> },
    /// No usable value at all.
    Missing,
    /// The total moved backwards without a month boundary to excuse it.
    NegativeDelta,
    /// The provider revised today's figure upward; amend today's point.
    Corrected { delta: f64 },
    /// Push `days` uniform points ending at the effective date.
    Backfill {
        per_day: f64,
        days: i64,
        stats_start: NaiveDate,
        source: DailySource,
    },
}

pub struct Reconciler {
    sink: Arc<dyn StatisticsSink>,
    clock: Arc<dyn Clock>,
    series_prefix: String,
}

impl Reconciler {
    pub fn new(
        sink: Arc<dyn StatisticsSink>,
        clock: Arc<dyn Clock>,
        series_prefix: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            clock,
            series_prefix: series_prefix.into(),
        }
    }

    fn metadata(&self, fluid: Fluid) -> SeriesMetadata {
        SeriesMetadata {
            series_id: format!("{}_{}", self.series_prefix, fluid.key()),
            name: format!("Ocea {} consumption", fluid.key()),
            unit: fluid.unit(),
        }
    }

    /// Reconcile one fluid's snapshot against its persisted baseline.
    ///
    /// Mutates `state` only when the reading is trusted. Statistics-sink
    /// writes are best-effort; a failed write downgrades nothing.
    pub async fn reconcile(
        &self,
        fluid: Fluid,
        snapshot: &FluidSnapshot,
        state: &mut FluidState,
    ) -> FluidResult {
        let today = self.clock.today();
        let api_date = snapshot.latest_date;
        let effective_date = resolve_effective_date(api_date, today);

        let status = classify(snapshot.latest_value, effective_date, state);

        // Fallback substitution: degrade to last-known-good rather than
        // report a reading we just rejected.
        let (value_used, date_used, status) = match status {
            ValueStatus::Missing | ValueStatus::Invalid
                if state.last_total.is_some() && state.last_total_at.is_some() =>
            {
                debug!(fluid = %fluid, %status, "substituting last trusted total");
                (state.last_total, state.last_total_at, SubstitutedStale)
            }
            ValueStatus::Missing | ValueStatus::Invalid => (None, None, Plain(status)),
            _ => (snapshot.latest_value, Some(effective_date), Plain(status)),
        };
        let value_status = match status {
            Plain(status) => status,
            SubstitutedStale => ValueStatus::Stale,
        };

        let outcome = derive_daily(&status, value_used, date_used, state);
        let (daily, daily_status, daily_source) =
            self.apply_outcome(fluid, outcome, date_used).await;

        let (estimated_today, estimated_today_source) = match (daily, value_used) {
            (Some(daily), _) => (Some(daily), daily_source),
            (None, Some(value)) => {
                // Average over the value's own month position, not today's.
                let day = date_used
                    .or(state.last_total_at)
                    .unwrap_or(today)
                    .day()
                    .max(1) as f64;
                (Some(round3(value / day)), Some(DailySource::MonthlyAverage))
            }
            (None, None) => (None, None),
        };

        if value_status == ValueStatus::Ok {
            let changed = match state.last_total {
                Some(baseline) => value_used
                    .map(|value| (value - baseline).abs() > EPSILON)
                    .unwrap_or(false),
                None => true,
            };
            if changed {
                state.last_total = value_used;
                state.last_total_at = Some(effective_date);
            }
        }

        info!(
            fluid = %fluid.label(),
            total = ?value_used,
            unit = %snapshot.unit,
            leak = snapshot.leak_estimate.as_deref().unwrap_or("unknown"),
            api_date = ?api_date,
            effective_date = %effective_date,
            status = %value_status,
            daily_status = %daily_status,
            "reconciled"
        );

        FluidResult {
            total: value_used,
            unit: snapshot.unit,
            leak_estimate: snapshot
                .leak_estimate
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            daily,
            daily_status,
            daily_source,
            estimated_today,
            estimated_today_source,
            latest_date: date_used,
            api_latest_date: api_date,
            value_status,
            last_total: state.last_total,
            last_total_at: state.last_total_at,
        }
    }

    /// Run the statistics side effects for an outcome and collapse it to
    /// the reported (daily, status, source) triple.
    async fn apply_outcome(
        &self,
        fluid: Fluid,
        outcome: DailyOutcome,
        date_used: Option<NaiveDate>,
    ) -> (Option<f64>, DailyStatus, Option<DailySource>) {
        match outcome {
            DailyOutcome::Stale { source } => (None, DailyStatus::Stale, source),
            DailyOutcome::Missing => (None, DailyStatus::Missing, None),
            DailyOutcome::NegativeDelta => {
                (None, DailyStatus::Invalid, Some(DailySource::NegativeDelta))
            }
            DailyOutcome::Corrected { delta } => {
                // The status reflects the upward revision itself; the
                // amendment is best-effort like every other sink write.
                let daily = match date_used {
                    Some(date) => self.correct_same_day(fluid, date, delta).await,
                    None => None,
                };
                (
                    daily,
                    DailyStatus::Corrected,
                    Some(DailySource::SameDayCorrection),
                )
            }
            DailyOutcome::Backfill {
                per_day,
                days,
                stats_start,
                source,
            } => {
                if let Some(end) = date_used {
                    self.push_range(fluid, stats_start, end, per_day).await;
                }
                let status = if days == 1 {
                    DailyStatus::Ok
                } else {
                    DailyStatus::Estimated
                };
                (Some(per_day), status, Some(source))
            }
        }
    }

    /// Amend today's already-pushed point in place. Returns the revised
    /// per-day state, or None if no matching point exists or the revision
    /// would go negative.
    async fn correct_same_day(&self, fluid: Fluid, date: NaiveDate, delta: f64) -> Option<f64> {
        let metadata = self.metadata(fluid);
        let last = match self.sink.last_point(&metadata.series_id).await {
            Ok(last) => last?,
            Err(err) => {
                debug!(fluid = %fluid, %err, "statistics lookup failed; skipping correction");
                return None;
            }
        };
        if last.start != date {
            return None;
        }
        let new_state = round3(last.state + delta);
        if new_state < 0.0 {
            return None;
        }
        let point = StatPoint {
            start: date,
            state: new_state,
            sum: round3(last.sum + delta),
        };
        if let Err(err) = self.sink.append(&metadata, &[point]).await {
            debug!(fluid = %fluid, %err, "statistics write failed; correction dropped");
            return None;
        }
        Some(new_state)
    }

    /// Uniform backfill: one synthetic point per day from the last pushed
    /// date (exclusive) to `end` (inclusive), sums seeded from the sink.
    async fn push_range(&self, fluid: Fluid, stats_start: NaiveDate, end: NaiveDate, per_day: f64) {
        let metadata = self.metadata(fluid);
        let (start, mut sum) = match self.sink.last_point(&metadata.series_id).await {
            Ok(Some(last)) => (stats_start.max(last.start), last.sum),
            Ok(None) => (stats_start, 0.0),
            Err(err) => {
                debug!(fluid = %fluid, %err, "statistics lookup failed; skipping backfill");
                return;
            }
        };
        let days = (end - start).num_days();
        if days <= 0 {
            return;
        }
        let mut points = Vec::with_capacity(days as usize);
        for offset in 1..=days {
            sum = round3(sum + per_day);
            points.push(StatPoint {
                start: start + Duration::days(offset),
                state: per_day,
                sum,
            });
        }
        if let Err(err) = self.sink.append(&metadata, &points).await {
            debug!(fluid = %fluid, %err, "statistics write failed; backfill dropped");
        }
    }
}

use StatusAfterSubstitution::{Plain, SubstitutedStale};

/// Value status with the substitution flag kept for the daily table.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StatusAfterSubstitution {
    Plain(ValueStatus),
    SubstitutedStale,
}

/// Monthly aggregators often stamp month-start artificially; an absent or
/// first-of-month date while the month is already under way is replaced
/// with yesterday.
fn resolve_effective_date(api_date: Option<NaiveDate>, today: NaiveDate) -> NaiveDate {
    match api_date {
        Some(date) if !(date.day() == 1 && today.day() > 1) => date,
        _ => today - Duration::days(1),
    }
}

fn classify(total: Option<f64>, effective_date: NaiveDate, state: &FluidState) -> ValueStatus {
    let Some(total) = total else {
        return ValueStatus::Missing;
    };
    if total < 0.0 {
        return ValueStatus::Invalid;
    }
    let (Some(baseline), Some(baseline_date)) = (state.last_total, state.last_total_at) else {
        return ValueStatus::Ok;
    };
    if effective_date < baseline_date {
        return ValueStatus::Invalid;
    }
    if effective_date.month() == baseline_date.month()
        && ((total == 0.0 && baseline > 0.0) || total + EPSILON < baseline)
    {
        return ValueStatus::Invalid;
    }
    if (total - baseline).abs() <= EPSILON && effective_date > baseline_date {
        return ValueStatus::Stale;
    }
    ValueStatus::Ok
}

fn derive_daily(
    status: &StatusAfterSubstitution,
    value_used: Option<f64>,
    date_used: Option<NaiveDate>,
    state: &FluidState,
) -> DailyOutcome {
    match status {
        SubstitutedStale => {
            return DailyOutcome::Stale {
                source: Some(DailySource::StaleTotal),
            }
        }
        Plain(ValueStatus::Stale) => {
            return DailyOutcome::Stale {
                source: Some(DailySource::StaleTotal),
            }
        }
        Plain(ValueStatus::Missing) | Plain(ValueStatus::Invalid) => return DailyOutcome::Missing,
        Plain(ValueStatus::Ok) => {}
    }
    let (Some(total), Some(date)) = (value_used, date_used) else {
        return DailyOutcome::Missing;
    };
    let (Some(baseline), Some(baseline_date)) = (state.last_total, state.last_total_at) else {
        return DailyOutcome::Missing;
    };

    let delta = total - baseline;
    if date == baseline_date {
        return if delta > EPSILON {
            DailyOutcome::Corrected { delta }
        } else if delta < -EPSILON {
            DailyOutcome::NegativeDelta
        } else {
            DailyOutcome::Stale { source: None }
        };
    }

    if delta < -EPSILON {
        if date.month() != baseline_date.month() {
            // Meter or billing-period reset: the new total is this month's
            // consumption so far, counted from the month boundary.
            let stats_start = date.with_day(1).unwrap_or(date) - Duration::days(1);
            let days = (date - stats_start).num_days().max(1);
            return DailyOutcome::Backfill {
                per_day: round3(total / days as f64),
                days,
                stats_start,
                source: DailySource::MonthReset,
            };
        }
        return DailyOutcome::NegativeDelta;
    }

    if delta.abs() <= EPSILON {
        return DailyOutcome::Stale {
            source: Some(DailySource::NoChange),
        };
    }

    let days = (date - baseline_date).num_days().max(1);
    DailyOutcome::Backfill {
        per_day: round3(delta / days as f64),
        days,
        stats_start: baseline_date,
        source: if days == 1 {
            DailySource::Delta
        } else {
            DailySource::MultiDayEstimate
        },
    }
}
