use crate::upstream::AirQualityReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
    #[error("Record not found")]
    NotFound,
}

/// A persisted air quality observation. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReadingRecord {
    pub id: Uuid,
    pub lat: f64,
    pub lon: f64,
    pub aqi: i64,
    /// Pollutant concentrations as a JSON object, e.g. {"pm2_5": 12.4}.
    pub components: String,
    pub saved_at: DateTime<Utc>,
}

impl ReadingRecord {
    pub fn components_map(&self) -> HashMap<String, f64> {
        serde_json::from_str(&self.components).unwrap_or_default()
    }
}

/// Append-only log of places a user looked up.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VisitRecord {
    pub id: Uuid,
    pub user_id: String,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
    pub visited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SavedLocation {
    pub user_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub updated_at: DateTime<Utc>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS air_readings (
                id TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                aqi INTEGER NOT NULL,
                components TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS location_visits (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                name TEXT NOT NULL,
                visited_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saved_locations (
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_readings_saved_at ON air_readings(saved_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_visits_user_time ON location_visits(user_id, visited_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_reading(&self, reading: &AirQualityReading) -> Result<(), DatabaseError> {
        let components =
            serde_json::to_string(&reading.components).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO air_readings (id, lat, lon, aqi, components, saved_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(reading.coordinates.lat)
        .bind(reading.coordinates.lon)
        .bind(reading.aqi)
        .bind(components)
        .bind(reading.captured_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All readings saved on or after `since`. Radius filtering happens in
    /// the aggregator; SQLite has no spatial index worth leaning on here.
    pub async fn readings_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReadingRecord>, DatabaseError> {
        let results = sqlx::query_as::<_, ReadingRecord>(
            "SELECT * FROM air_readings WHERE saved_at >= $1 ORDER BY saved_at DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }

    pub async fn record_visit(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        name: &str,
    ) -> Result<VisitRecord, DatabaseError> {
        let visit = VisitRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            lat,
            lon,
            name: name.to_string(),
            visited_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO location_visits (id, user_id, lat, lon, name, visited_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(visit.id)
        .bind(&visit.user_id)
        .bind(visit.lat)
        .bind(visit.lon)
        .bind(&visit.name)
        .bind(visit.visited_at)
        .execute(&self.pool)
        .await?;

        Ok(visit)
    }

    pub async fn visits_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<VisitRecord>, DatabaseError> {
        let results = sqlx::query_as::<_, VisitRecord>(
            r#"
            SELECT * FROM location_visits
            WHERE user_id = $1 AND visited_at >= $2
            ORDER BY visited_at DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }

    /// At most one saved location per (user, name); a second save for the
    /// same pair overwrites the coordinates.
    pub async fn upsert_saved_location(
        &self,
        user_id: &str,
        name: &str,
        lat: f64,
        lon: f64,
    ) -> Result<SavedLocation, DatabaseError> {
        let result = sqlx::query_as::<_, SavedLocation>(
            r#"
            INSERT INTO saved_locations (user_id, name, lat, lon, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, name)
            DO UPDATE SET lat = excluded.lat, lon = excluded.lon, updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(lat)
        .bind(lon)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn saved_locations(&self, user_id: &str) -> Result<Vec<SavedLocation>, DatabaseError> {
        let results = sqlx::query_as::<_, SavedLocation>(
            "SELECT * FROM saved_locations WHERE user_id = $1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }

    /// Delete requires ownership: a mismatched user sees not-found, the
    /// record stays intact.
    pub async fn delete_saved_location(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM saved_locations WHERE user_id = $1 AND name = $2")
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
