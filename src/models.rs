use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A tracked utility commodity with its own unit and statistics series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fluid {
    ColdWater,
    HotWater,
    /// Collective thermal energy (CETC) for heating.
    ThermalEnergy,
}

impl Fluid {
    pub const ALL: [Fluid; 3] = [Fluid::ColdWater, Fluid::HotWater, Fluid::ThermalEnergy];

    /// Key used in persisted state and statistics series ids.
    pub fn key(&self) -> &'static str {
        match self {
            Fluid::ColdWater => "eau_froide",
            Fluid::HotWater => "eau_chaude",
            Fluid::ThermalEnergy => "cetc",
        }
    }

    /// Path segment the consumption endpoint expects.
    pub fn api_name(&self) -> &'static str {
        match self {
            Fluid::ColdWater => "EauFroide",
            Fluid::HotWater => "EauChaude",
            Fluid::ThermalEnergy => "Cetc",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Fluid::ColdWater => "Eau froide",
            Fluid::HotWater => "Eau chaude",
            Fluid::ThermalEnergy => "CETC",
        }
    }

    /// Canonical unit readings are normalized to.
    pub fn unit(&self) -> Unit {
        match self {
            Fluid::ColdWater | Fluid::HotWater => Unit::Liters,
            Fluid::ThermalEnergy => Unit::KilowattHours,
        }
    }
}

impl fmt::Display for Fluid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Liters,
    CubicMeters,
    KilowattHours,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Liters => "L",
            Unit::CubicMeters => "m3",
            Unit::KilowattHours => "kWh",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One fluid's normalized reading from a single poll. Immutable once the
/// fetcher produces it.
#[derive(Debug, Clone, PartialEq)]
pub struct FluidSnapshot {
    /// Most recent meter total, already converted to the canonical unit.
    pub latest_value: Option<f64>,
    /// Date the provider stamped on the most recent record.
    pub latest_date: Option<NaiveDate>,
    /// Raw leak indicator text, if the provider sent one.
    pub leak_estimate: Option<String>,
    pub unit: Unit,
    /// Naive day-over-day delta between the two most recent records.
    /// Informational only; negative deltas are already discarded.
    pub daily: Option<f64>,
}

impl FluidSnapshot {
    pub fn empty(unit: Unit) -> Self {
        Self {
            latest_value: None,
            latest_date: None,
            leak_estimate: None,
            unit,
            daily: None,
        }
    }
}

/// The last trusted (total, date) pair for a fluid, persisted across polls.
/// Only updated when a poll is classified `ok`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FluidState {
    #[serde(default)]
    pub last_total: Option<f64>,
    #[serde(default)]
    pub last_total_at: Option<NaiveDate>,
}

/// Trustworthiness of the current poll's reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueStatus {
    Ok,
    Stale,
    Invalid,
    Missing,
}

impl ValueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueStatus::Ok => "ok",
            ValueStatus::Stale => "stale",
            ValueStatus::Invalid => "invalid",
            ValueStatus::Missing => "missing",
        }
    }
}

impl fmt::Display for ValueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DailyStatus {
    Ok,
    Estimated,
    Corrected,
    Stale,
    Invalid,
    Missing,
}

impl DailyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DailyStatus::Ok => "ok",
            DailyStatus::Estimated => "estimated",
            DailyStatus::Corrected => "corrected",
            DailyStatus::Stale => "stale",
            DailyStatus::Invalid => "invalid",
            DailyStatus::Missing => "missing",
        }
    }
}

impl fmt::Display for DailyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a daily figure (or its absence) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailySource {
    StaleTotal,
    InvalidTotal,
    NegativeDelta,
    SameDayCorrection,
    MonthReset,
    NoChange,
    Delta,
    MultiDayEstimate,
    MonthlyAverage,
}

impl DailySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DailySource::StaleTotal => "stale_total",
            DailySource::InvalidTotal => "invalid_total",
            DailySource::NegativeDelta => "negative_delta",
            DailySource::SameDayCorrection => "same_day_correction",
            DailySource::MonthReset => "month_reset",
            DailySource::NoChange => "no_change",
            DailySource::Delta => "delta",
            DailySource::MultiDayEstimate => "multi_day_estimate",
            DailySource::MonthlyAverage => "monthly_average",
        }
    }
}

impl fmt::Display for DailySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-fluid reconciliation output for one poll. Recomputed every cycle,
/// never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FluidResult {
    /// Effective total after fallback substitution.
    pub total: Option<f64>,
    pub unit: Unit,
    pub leak_estimate: String,
    pub daily: Option<f64>,
    pub daily_status: DailyStatus,
    pub daily_source: Option<DailySource>,
    pub estimated_today: Option<f64>,
    pub estimated_today_source: Option<DailySource>,
    /// Effective date used for delta computation.
    pub latest_date: Option<NaiveDate>,
    /// Date exactly as the provider reported it.
    pub api_latest_date: Option<NaiveDate>,
    pub value_status: ValueStatus,
    pub last_total: Option<f64>,
    pub last_total_at: Option<NaiveDate>,
}
