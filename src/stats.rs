//! Long-term statistics sink.
//!
//! Daily consumption points accumulate into per-series files so the history
//! survives restarts. Points are keyed by their start date; re-appending a
//! date replaces the earlier point, which is how same-day corrections land.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::models::Unit;

/// One daily statistics point: the day's consumption and the running sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatPoint {
    pub start: NaiveDate,
    /// Consumption attributed to this day.
    pub state: f64,
    /// Cumulative sum including this day.
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    pub series_id: String,
    pub name: String,
    pub unit: Unit,
}

#[async_trait]
pub trait StatisticsSink: Send + Sync {
    /// Append points to a series, replacing any existing point with the
    /// same start date.
    async fn append(&self, metadata: &SeriesMetadata, points: &[StatPoint]) -> anyhow::Result<()>;

    /// The most recent point in a series, if any.
    async fn last_point(&self, series_id: &str) -> anyhow::Result<Option<StatPoint>>;
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemoryStatisticsSink {
    series: Mutex<HashMap<String, Vec<StatPoint>>>,
}

impl MemoryStatisticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a series, sorted by date.
    pub async fn points(&self, series_id: &str) -> Vec<StatPoint> {
        self.series
            .lock()
            .await
            .get(series_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatisticsSink for MemoryStatisticsSink {
    async fn append(&self, metadata: &SeriesMetadata, points: &[StatPoint]) -> anyhow::Result<()> {
        let mut series = self.series.lock().await;
        let existing = series.entry(metadata.series_id.clone()).or_default();
        upsert(existing, points);
        Ok(())
    }

    async fn last_point(&self, series_id: &str) -> anyhow::Result<Option<StatPoint>> {
        Ok(self
            .series
            .lock()
            .await
            .get(series_id)
            .and_then(|points| points.last().copied()))
    }
}

/// File-backed sink: one JSON-lines file per series under a base directory.
#[derive(Debug, Clone)]
pub struct JsonlStatisticsSink {
    base_path: PathBuf,
}

impl JsonlStatisticsSink {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn series_path(&self, series_id: &str) -> PathBuf {
        self.base_path.join(format!("{series_id}.jsonl"))
    }

    async fn read_series(&self, series_id: &str) -> anyhow::Result<Vec<StatPoint>> {
        let path = self.series_path(series_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let mut points = Vec::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let point: StatPoint = serde_json::from_str(line)
                .with_context(|| format!("parsing statistics line in {}", path.display()))?;
            points.push(point);
        }
        Ok(points)
    }

    async fn write_series(&self, series_id: &str, points: &[StatPoint]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .with_context(|| format!("creating {}", self.base_path.display()))?;
        let mut contents = String::new();
        for point in points {
            contents.push_str(&serde_json::to_string(point)?);
            contents.push('\n');
        }
        let path = self.series_path(series_id);
        fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[async_trait]
impl StatisticsSink for JsonlStatisticsSink {
    async fn append(&self, metadata: &SeriesMetadata, points: &[StatPoint]) -> anyhow::Result<()> {
        let mut existing = self.read_series(&metadata.series_id).await?;
        upsert(&mut existing, points);
        self.write_series(&metadata.series_id, &existing).await
    }

    async fn last_point(&self, series_id: &str) -> anyhow::Result<Option<StatPoint>> {
        let points = self.read_series(series_id).await?;
        Ok(points.last().copied())
    }
}

fn upsert(existing: &mut Vec<StatPoint>, incoming: &[StatPoint]) {
    for point in incoming {
        match existing.iter_mut().find(|p| p.start == point.start) {
            Some(slot) => *slot = *point,
            None => existing.push(*point),
        }
    }
    existing.sort_by_key(|point| point.start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Unit;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn metadata() -> SeriesMetadata {
        SeriesMetadata {
            series_id: "ocea_eau_froide".into(),
            name: "Ocea eau_froide consumption".into(),
            unit: Unit::Liters,
        }
    }

    #[tokio::test]
    async fn memory_sink_replaces_same_day_points() {
        let sink = MemoryStatisticsSink::new();
        let meta = metadata();
        sink.append(&meta, &[StatPoint { start: date(1), state: 10.0, sum: 10.0 }])
            .await
            .unwrap();
        sink.append(&meta, &[StatPoint { start: date(1), state: 12.0, sum: 12.0 }])
            .await
            .unwrap();

        let points = sink.points("ocea_eau_froide").await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].state, 12.0);
    }

    #[tokio::test]
    async fn memory_sink_keeps_points_sorted() {
        let sink = MemoryStatisticsSink::new();
        let meta = metadata();
        sink.append(&meta, &[StatPoint { start: date(5), state: 1.0, sum: 5.0 }])
            .await
            .unwrap();
        sink.append(&meta, &[StatPoint { start: date(2), state: 1.0, sum: 2.0 }])
            .await
            .unwrap();

        let last = sink.last_point("ocea_eau_froide").await.unwrap().unwrap();
        assert_eq!(last.start, date(5));
    }

    #[tokio::test]
    async fn jsonl_sink_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata();
        let points = [
            StatPoint { start: date(1), state: 10.0, sum: 10.0 },
            StatPoint { start: date(2), state: 5.0, sum: 15.0 },
        ];
        {
            let sink = JsonlStatisticsSink::new(dir.path());
            sink.append(&meta, &points).await.unwrap();
        }

        let sink = JsonlStatisticsSink::new(dir.path());
        let last = sink.last_point("ocea_eau_froide").await.unwrap().unwrap();
        assert_eq!(last.start, date(2));
        assert_eq!(last.sum, 15.0);
    }

    #[tokio::test]
    async fn jsonl_sink_missing_series_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlStatisticsSink::new(dir.path());
        assert_eq!(sink.last_point("nope").await.unwrap(), None);
    }
}
