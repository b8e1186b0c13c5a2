//! Keyed lookups and updates over trips, reservations and drivers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::TripStatus;

/// The relational store as seen by the dispatcher. Schema design lives elsewhere.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// `None` when the trip does not exist.
    async fn trip_status(&self, trip_id: i64) -> AppResult<Option<TripStatus>>;

    /// Returns `false` when the trip does not exist.
    async fn set_trip_status(&self, trip_id: i64, status: TripStatus) -> AppResult<bool>;

    /// Reservations across the driver's scheduled and in-progress trips.
    async fn reservation_count(&self, driver_id: i64) -> AppResult<i64>;

    /// Returns `false` when the driver does not exist.
    async fn set_driver_status(
        &self,
        driver_id: i64,
        status: &str,
        destination: Option<&str>,
    ) -> AppResult<bool>;

    /// User ids holding reservations on the driver's active trips.
    async fn passengers_for_driver(&self, driver_id: i64) -> AppResult<Vec<String>>;
}

fn decode_status(raw: &str) -> AppResult<TripStatus> {
    TripStatus::parse(raw)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown trip status in store: {}", raw)))
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgFleetStore {
    pool: DbPool,
}

impl PgFleetStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FleetStore for PgFleetStore {
    async fn trip_status(&self, trip_id: i64) -> AppResult<Option<TripStatus>> {
        let raw = sqlx::query_scalar::<_, String>("SELECT status FROM trips WHERE id = $1")
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await?;
        raw.as_deref().map(decode_status).transpose()
    }

    async fn set_trip_status(&self, trip_id: i64, status: TripStatus) -> AppResult<bool> {
        let result = sqlx::query("UPDATE trips SET status = $2 WHERE id = $1")
            .bind(trip_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reservation_count(&self, driver_id: i64) -> AppResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM reservations r
            JOIN trips t ON t.id = r.trip_id
            WHERE t.driver_id = $1 AND t.status IN ('scheduled', 'in_progress')
            "#,
        )
        .bind(driver_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn set_driver_status(
        &self,
        driver_id: i64,
        status: &str,
        destination: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE drivers SET status = $2, destination = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(driver_id)
        .bind(status)
        .bind(destination)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn passengers_for_driver(&self, driver_id: i64) -> AppResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT r.user_id
            FROM reservations r
            JOIN trips t ON t.id = r.trip_id
            WHERE t.driver_id = $1 AND t.status IN ('scheduled', 'in_progress')
            ORDER BY r.user_id
            "#,
        )
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
struct TripRecord {
    driver_id: i64,
    status: TripStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRecord {
    pub status: String,
    pub destination: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    trips: HashMap<i64, TripRecord>,
    /// (trip_id, user_id)
    reservations: Vec<(i64, String)>,
    drivers: HashMap<i64, DriverRecord>,
}

/// In-process store for single-node deployments without a database, and for tests.
#[derive(Clone, Default)]
pub struct MemoryFleetStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_trip(&self, trip_id: i64, driver_id: i64, status: TripStatus) {
        let mut state = self.state.write().await;
        state.trips.insert(trip_id, TripRecord { driver_id, status });
        state.drivers.entry(driver_id).or_insert_with(|| DriverRecord {
            status: "offline".to_string(),
            destination: None,
        });
    }

    pub async fn add_reservation(&self, trip_id: i64, user_id: &str) {
        let mut state = self.state.write().await;
        state.reservations.push((trip_id, user_id.to_string()));
    }

    pub async fn driver(&self, driver_id: i64) -> Option<DriverRecord> {
        self.state.read().await.drivers.get(&driver_id).cloned()
    }
}

fn active_trip_ids(state: &MemoryState, driver_id: i64) -> Vec<i64> {
    state
        .trips
        .iter()
        .filter(|(_, t)| t.driver_id == driver_id && !t.status.is_terminal())
        .map(|(id, _)| *id)
        .collect()
}

#[async_trait]
impl FleetStore for MemoryFleetStore {
    async fn trip_status(&self, trip_id: i64) -> AppResult<Option<TripStatus>> {
        Ok(self.state.read().await.trips.get(&trip_id).map(|t| t.status))
    }

    async fn set_trip_status(&self, trip_id: i64, status: TripStatus) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state.trips.get_mut(&trip_id) {
            Some(trip) => {
                trip.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reservation_count(&self, driver_id: i64) -> AppResult<i64> {
        let state = self.state.read().await;
        let trips = active_trip_ids(&state, driver_id);
        let count = state
            .reservations
            .iter()
            .filter(|(trip_id, _)| trips.contains(trip_id))
            .count();
        Ok(count as i64)
    }

    async fn set_driver_status(
        &self,
        driver_id: i64,
        status: &str,
        destination: Option<&str>,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state.drivers.get_mut(&driver_id) {
            Some(driver) => {
                driver.status = status.to_string();
                driver.destination = destination.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn passengers_for_driver(&self, driver_id: i64) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        let trips = active_trip_ids(&state, driver_id);
        let mut users: Vec<String> = state
            .reservations
            .iter()
            .filter(|(trip_id, _)| trips.contains(trip_id))
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_counts_only_active_trips() {
        let store = MemoryFleetStore::new();
        store.insert_trip(1, 7, TripStatus::Scheduled).await;
        store.insert_trip(2, 7, TripStatus::Completed).await;
        store.insert_trip(3, 8, TripStatus::InProgress).await;
        store.add_reservation(1, "ana").await;
        store.add_reservation(1, "ben").await;
        store.add_reservation(2, "cid").await;
        store.add_reservation(3, "dee").await;

        assert_eq!(store.reservation_count(7).await.unwrap(), 2);
        assert_eq!(store.reservation_count(8).await.unwrap(), 1);
        assert_eq!(store.reservation_count(9).await.unwrap(), 0);
        assert_eq!(
            store.passengers_for_driver(7).await.unwrap(),
            vec!["ana".to_string(), "ben".to_string()]
        );
    }

    #[tokio::test]
    async fn memory_store_updates_trip_and_driver() {
        let store = MemoryFleetStore::new();
        store.insert_trip(42, 7, TripStatus::Scheduled).await;

        assert!(store.set_trip_status(42, TripStatus::InProgress).await.unwrap());
        assert!(!store.set_trip_status(43, TripStatus::InProgress).await.unwrap());
        assert_eq!(
            store.trip_status(42).await.unwrap(),
            Some(TripStatus::InProgress)
        );
        assert_eq!(store.trip_status(43).await.unwrap(), None);

        assert!(store
            .set_driver_status(7, "in_transit", Some("Central Station"))
            .await
            .unwrap());
        assert!(!store.set_driver_status(99, "offline", None).await.unwrap());
        assert_eq!(
            store.driver(7).await,
            Some(DriverRecord {
                status: "in_transit".to_string(),
                destination: Some("Central Station".to_string()),
            })
        );
    }
}
