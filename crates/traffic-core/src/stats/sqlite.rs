//! SQLite-backed aggregate store.
//!
//! The store owns a small Tokio runtime and exposes a blocking API so camera
//! workers (plain OS threads) can call it directly. Callers running inside an
//! async executor must hop onto a blocking thread first.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::{
    error::StoreError,
    stats::{
        VehicleClass,
        store::{AggregateStore, DailyStatAggregate, StatKey},
    },
};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS daily_stats (
    id TEXT PRIMARY KEY NOT NULL,
    camera_id TEXT NOT NULL,
    date TEXT NOT NULL,
    total_car INTEGER NOT NULL DEFAULT 0,
    total_motorcycle INTEGER NOT NULL DEFAULT 0,
    total_bus INTEGER NOT NULL DEFAULT 0,
    total_truck INTEGER NOT NULL DEFAULT 0,
    speed_sum REAL NOT NULL DEFAULT 0,
    speed_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
)";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS daily_stats_camera_date ON daily_stats (camera_id, date)";

// One statement: insert the zeroed record with this crossing applied, or add
// the same deltas to the existing row. `processed_at` is set on insert only.
const UPSERT: &str = "INSERT INTO daily_stats (
    id, camera_id, date,
    total_car, total_motorcycle, total_bus, total_truck,
    speed_sum, speed_count, processed_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(id) DO UPDATE SET
    total_car = total_car + excluded.total_car,
    total_motorcycle = total_motorcycle + excluded.total_motorcycle,
    total_bus = total_bus + excluded.total_bus,
    total_truck = total_truck + excluded.total_truck,
    speed_sum = speed_sum + excluded.speed_sum,
    speed_count = speed_count + excluded.speed_count";

const SELECT: &str = "SELECT camera_id, date,
    total_car, total_motorcycle, total_bus, total_truck,
    speed_sum, speed_count, processed_at
FROM daily_stats WHERE id = ?1";

pub struct SqliteStore {
    runtime: Runtime,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite://traffic.db` or `sqlite::memory:`) and
    /// create the schema when missing.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sqlite-store")
            .enable_all()
            .build()?;

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // Every in-memory connection is its own database, so pin a single one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = runtime.block_on(async move {
            let pool = pool_options.connect_with(options).await?;
            sqlx::query(CREATE_TABLE).execute(&pool).await?;
            sqlx::query(CREATE_INDEX).execute(&pool).await?;
            Ok::<_, sqlx::Error>(pool)
        })?;
        debug!("connected aggregate store at {url}");

        Ok(Self { runtime, pool })
    }
}

impl AggregateStore for SqliteStore {
    fn increment(
        &self,
        key: &StatKey,
        class: VehicleClass,
        speed_kmh: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let one_if = |candidate: VehicleClass| i64::from(class == candidate);
        let (speed_sum, speed_count) = match speed_kmh {
            Some(speed) => (speed, 1_i64),
            None => (0.0, 0_i64),
        };

        self.runtime.block_on(
            sqlx::query(UPSERT)
                .bind(key.id())
                .bind(key.camera_id.clone())
                .bind(key.date_string())
                .bind(one_if(VehicleClass::Car))
                .bind(one_if(VehicleClass::Motorcycle))
                .bind(one_if(VehicleClass::Bus))
                .bind(one_if(VehicleClass::Truck))
                .bind(speed_sum)
                .bind(speed_count)
                .bind(at.to_rfc3339())
                .execute(&self.pool),
        )?;
        Ok(())
    }

    fn load(&self, key: &StatKey) -> Result<Option<DailyStatAggregate>, StoreError> {
        let row = self.runtime.block_on(
            sqlx::query(SELECT)
                .bind(key.id())
                .fetch_optional(&self.pool),
        )?;
        row.map(|row| aggregate_from_row(&row)).transpose()
    }
}

fn aggregate_from_row(row: &SqliteRow) -> Result<DailyStatAggregate, StoreError> {
    let date: String = row.try_get("date")?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|err| StoreError::Unavailable(format!("corrupt date {date:?}: {err}")))?;
    let processed_at: String = row.try_get("processed_at")?;
    let processed_at = DateTime::parse_from_rfc3339(&processed_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Unavailable(format!("corrupt timestamp: {err}")))?;

    let counter = |column: &str| -> Result<u64, StoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };

    Ok(DailyStatAggregate {
        camera_id: row.try_get("camera_id")?,
        date,
        total_car: counter("total_car")?,
        total_motorcycle: counter("total_motorcycle")?,
        total_bus: counter("total_bus")?,
        total_truck: counter("total_truck")?,
        speed_sum: row.try_get("speed_sum")?,
        speed_count: counter("speed_count")?,
        processed_at,
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn key() -> StatKey {
        StatKey::new("cam-7", NaiveDate::from_ymd_opt(2026, 5, 1).unwrap())
    }

    #[test]
    fn absent_record_loads_as_none() {
        let store = SqliteStore::connect("sqlite::memory:").unwrap();
        assert!(store.load(&key()).unwrap().is_none());
    }

    #[test]
    fn upsert_creates_then_accumulates() {
        let store = SqliteStore::connect("sqlite::memory:").unwrap();
        store
            .increment(&key(), VehicleClass::Car, Some(40.0), Utc::now())
            .unwrap();
        store
            .increment(&key(), VehicleClass::Car, Some(60.0), Utc::now())
            .unwrap();
        store
            .increment(&key(), VehicleClass::Motorcycle, None, Utc::now())
            .unwrap();

        let record = store.load(&key()).unwrap().unwrap();
        assert_eq!(record.camera_id, "cam-7");
        assert_eq!(record.total_car, 2);
        assert_eq!(record.total_motorcycle, 1);
        assert_eq!(record.total_bus, 0);
        assert_eq!(record.total_truck, 0);
        assert_eq!(record.speed_count, 2);
        assert!((record.average_speed() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn processed_at_survives_later_upserts() {
        let store = SqliteStore::connect("sqlite::memory:").unwrap();
        let first = DateTime::parse_from_rfc3339("2026-05-01T06:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2026-05-01T21:45:00Z")
            .unwrap()
            .with_timezone(&Utc);
        store
            .increment(&key(), VehicleClass::Bus, Some(20.0), first)
            .unwrap();
        store
            .increment(&key(), VehicleClass::Bus, None, later)
            .unwrap();

        let record = store.load(&key()).unwrap().unwrap();
        assert_eq!(record.total_bus, 2);
        assert_eq!(record.processed_at, first);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .increment(&key(), VehicleClass::Truck, Some(10.0), Utc::now())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = store.load(&key()).unwrap().unwrap();
        assert_eq!(record.total_truck, 100);
        assert_eq!(record.speed_count, 100);
    }
}
