use crate::database::{Database, DatabaseError, ReadingRecord, VisitRecord};
use crate::geo::haversine_distance;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Most visit groups returned by a frequency summary.
const VISIT_GROUP_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyAverage {
    pub date: NaiveDate,
    pub aqi: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitSummary {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub last_visit: chrono::DateTime<Utc>,
    pub visits: u64,
}

/// Read-only aggregation over persisted readings and visit logs. Both query
/// shapes are side-effect-free; callers cache them through the fetch-through
/// orchestrator.
pub struct HistoryAggregator {
    db: Arc<Database>,
    radius_km: f64,
}

impl HistoryAggregator {
    pub fn new(db: Arc<Database>, radius_km: f64) -> Self {
        Self { db, radius_km }
    }

    /// Mean AQI per UTC calendar day for readings within the radius and the
    /// lookback window, newest day first, at most one entry per window day.
    /// Days without readings are absent, not zero-filled.
    pub async fn daily_averages(
        &self,
        lat: f64,
        lon: f64,
        days: i64,
    ) -> Result<Vec<DailyAverage>, DatabaseError> {
        let since = Utc::now() - Duration::days(days);
        let readings = self.db.readings_since(since).await?;

        let nearby: Vec<ReadingRecord> = readings
            .into_iter()
            .filter(|r| haversine_distance(lat, lon, r.lat, r.lon) <= self.radius_km)
            .collect();

        Ok(average_by_day(&nearby, days))
    }

    /// Visit counts per (name, coordinate) for one user within the window,
    /// most recently visited first, capped at 50 groups.
    pub async fn visit_summary(
        &self,
        user_id: &str,
        days: i64,
    ) -> Result<Vec<VisitSummary>, DatabaseError> {
        let since = Utc::now() - Duration::days(days);
        let visits = self.db.visits_since(user_id, since).await?;
        Ok(summarize_visits(visits))
    }
}

fn average_by_day(readings: &[ReadingRecord], days: i64) -> Vec<DailyAverage> {
    let mut by_day: HashMap<NaiveDate, Vec<i64>> = HashMap::new();
    for reading in readings {
        by_day
            .entry(reading.saved_at.date_naive())
            .or_default()
            .push(reading.aqi);
    }

    let mut averages: Vec<DailyAverage> = by_day
        .into_iter()
        .map(|(date, values)| {
            let mean = values.iter().sum::<i64>() as f64 / values.len() as f64;
            DailyAverage {
                date,
                aqi: mean.round() as i64,
            }
        })
        .collect();

    averages.sort_by(|a, b| b.date.cmp(&a.date));
    averages.truncate(days.max(0) as usize);
    averages
}

fn summarize_visits(visits: Vec<VisitRecord>) -> Vec<VisitSummary> {
    let mut groups: HashMap<(String, u64, u64), VisitSummary> = HashMap::new();
    for visit in visits {
        let key = (visit.name.clone(), visit.lat.to_bits(), visit.lon.to_bits());
        groups
            .entry(key)
            .and_modify(|summary| {
                summary.visits += 1;
                if visit.visited_at > summary.last_visit {
                    summary.last_visit = visit.visited_at;
                }
            })
            .or_insert(VisitSummary {
                name: visit.name,
                lat: visit.lat,
                lon: visit.lon,
                last_visit: visit.visited_at,
                visits: 1,
            });
    }

    let mut summaries: Vec<VisitSummary> = groups.into_values().collect();
    summaries.sort_by(|a, b| b.last_visit.cmp(&a.last_visit));
    summaries.truncate(VISIT_GROUP_CAP);
    summaries
}
