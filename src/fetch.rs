//! Resident profile lookup and per-fluid consumption queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthClient;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Fluid, FluidSnapshot, Unit};

/// How far back each consumption query reaches. Monthly granularity means
/// this covers the current and previous billing month.
const QUERY_WINDOW_DAYS: i64 = 30;

/// Fetches normalized meter readings for every tracked fluid.
pub struct DataFetcher {
    auth: Arc<AuthClient>,
    api_base: String,
    clock: Arc<dyn Clock>,
}

impl DataFetcher {
    pub fn new(auth: Arc<AuthClient>, clock: Arc<dyn Clock>) -> Self {
        let api_base = auth.endpoints().api_base.clone();
        Self {
            auth,
            api_base,
            clock,
        }
    }

    /// One full fetch cycle: resolve the dwelling, then query each fluid.
    ///
    /// Any failed query fails the cycle; the scheduler retries on its
    /// regular interval.
    pub async fn fetch(&self) -> Result<BTreeMap<Fluid, FluidSnapshot>> {
        let local_id = self.resolve_local_id().await?;
        let (start, end) = self.query_window();

        let mut snapshots = BTreeMap::new();
        for fluid in Fluid::ALL {
            let snapshot = self.fetch_fluid(&local_id, fluid, start, end).await?;
            snapshots.insert(fluid, snapshot);
        }
        Ok(snapshots)
    }

    /// Look up the resident profile and pull the dwelling id out of the
    /// first occupation record.
    async fn resolve_local_id(&self) -> Result<String> {
        let url = format!("{}/resident", self.api_base);
        let profile = self.auth.get_json(&url).await?;

        let occupations = profile
            .get("occupations")
            .and_then(Value::as_array)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| Error::account("No occupations found for this account."))?;

        let local_id = occupations[0].get("logementId").and_then(|id| match id {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        local_id.ok_or_else(|| Error::account("Unable to determine local ID."))
    }

    async fn fetch_fluid(
        &self,
        local_id: &str,
        fluid: Fluid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FluidSnapshot> {
        let url = format!("{}/local/{}/conso/{}", self.api_base, local_id, fluid.api_name());
        let payload = json!({
            "debut": start.to_rfc3339_opts(SecondsFormat::Millis, true),
            "fin": end.to_rfc3339_opts(SecondsFormat::Millis, true),
            "granularity": "Month",
        });
        let body = self.auth.post_json(&url, &payload).await?;
        let snapshot = parse_conso(&body, fluid);
        debug!(
            fluid = %fluid,
            value = ?snapshot.latest_value,
            date = ?snapshot.latest_date,
            "fetched consumption"
        );
        Ok(snapshot)
    }

    fn query_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self
            .clock
            .now()
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| self.clock.now());
        (end - Duration::days(QUERY_WINDOW_DAYS), end)
    }
}

/// Normalize one consumption payload to a snapshot.
///
/// The provider wraps the records in an envelope: a `consommations` list
/// plus a single top-level `unite` covering all of them. Records arrive
/// in no guaranteed order and are sorted by their date string (ISO-8601,
/// so lexicographic order is chronological). Values reported in m3 are
/// converted to liters.
fn parse_conso(body: &Value, fluid: Fluid) -> FluidSnapshot {
    let mut snapshot = FluidSnapshot::empty(fluid.unit());

    let Some(records) = body
        .get("consommations")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
    else {
        return snapshot;
    };
    let mut records: Vec<&Value> = records.iter().collect();
    records.sort_by_key(|record| {
        record
            .get("date")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    });

    let (factor, unit) = match body.get("unite").and_then(Value::as_str) {
        Some("m3") => (1000.0, Unit::Liters),
        _ => (1.0, fluid.unit()),
    };
    let latest = records[records.len() - 1];
    snapshot.unit = unit;
    snapshot.latest_value = to_float(latest.get("valeur")).map(|value| value * factor);
    snapshot.latest_date = latest
        .get("date")
        .and_then(Value::as_str)
        .and_then(parse_date);
    snapshot.leak_estimate = latest
        .get("fuiteEstimee")
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });

    // Naive delta between the two most recent records; informational only.
    if records.len() >= 2 {
        let previous = to_float(records[records.len() - 2].get("valeur"));
        if let (Some(latest_value), Some(previous)) = (snapshot.latest_value, previous) {
            let delta = latest_value - previous * factor;
            if delta >= 0.0 {
                snapshot.daily = Some(round3(delta));
            }
        }
    }
    snapshot
}

/// Lenient date parse for provider timestamps: full RFC 3339 first, then a
/// bare datetime, then a bare date.
fn parse_date(text: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// Coerce a provider value to a number.
///
/// The leak field in particular mixes booleans, French yes/no words,
/// and comma-decimal numbers.
pub(crate) fn to_float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let lowered = text.trim().to_lowercase();
            match lowered.as_str() {
                "oui" | "yes" | "true" => Some(1.0),
                "non" | "no" | "false" | "pas de fuite" | "aucune fuite" => Some(0.0),
                _ => lowered.replace(',', ".").parse().ok(),
            }
        }
        _ => None,
    }
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
