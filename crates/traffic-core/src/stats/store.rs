//! Storage seam for daily aggregates.
//!
//! Implementations must apply [`AggregateStore::increment`] as one atomic
//! operation: creating the record with zeroed sibling counters, bumping the
//! class counter and accumulating the speed sample can never be observed
//! half-done, and two concurrent first writes for the same key must land in
//! the same record.

use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::{error::StoreError, stats::VehicleClass};

/// Aggregates are keyed per camera and calendar day.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatKey {
    pub camera_id: String,
    pub date: NaiveDate,
}

impl StatKey {
    pub fn new(camera_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            camera_id: camera_id.into(),
            date,
        }
    }

    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Composite identifier `"{camera_id}_{YYYY-MM-DD}"`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.camera_id, self.date_string())
    }
}

/// Persisted per-camera, per-day accumulator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyStatAggregate {
    pub camera_id: String,
    pub date: NaiveDate,
    pub total_car: u64,
    pub total_motorcycle: u64,
    pub total_bus: u64,
    pub total_truck: u64,
    pub speed_sum: f64,
    pub speed_count: u64,
    pub processed_at: DateTime<Utc>,
}

impl DailyStatAggregate {
    pub fn empty(key: &StatKey, at: DateTime<Utc>) -> Self {
        Self {
            camera_id: key.camera_id.clone(),
            date: key.date,
            total_car: 0,
            total_motorcycle: 0,
            total_bus: 0,
            total_truck: 0,
            speed_sum: 0.0,
            speed_count: 0,
            processed_at: at,
        }
    }

    fn count_mut(&mut self, class: VehicleClass) -> &mut u64 {
        match class {
            VehicleClass::Car => &mut self.total_car,
            VehicleClass::Motorcycle => &mut self.total_motorcycle,
            VehicleClass::Bus => &mut self.total_bus,
            VehicleClass::Truck => &mut self.total_truck,
        }
    }

    /// Apply one crossing in place. `processed_at` keeps the creation time.
    pub fn apply(&mut self, class: VehicleClass, speed_kmh: Option<f64>) {
        *self.count_mut(class) += 1;
        if let Some(speed) = speed_kmh {
            self.speed_sum += speed;
            self.speed_count += 1;
        }
    }

    pub fn average_speed(&self) -> f64 {
        if self.speed_count == 0 {
            0.0
        } else {
            self.speed_sum / self.speed_count as f64
        }
    }
}

pub trait AggregateStore: Send + Sync {
    /// Atomically upsert the record for `key` and count one `class` crossing.
    fn increment(
        &self,
        key: &StatKey,
        class: VehicleClass,
        speed_kmh: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn load(&self, key: &StatKey) -> Result<Option<DailyStatAggregate>, StoreError>;
}

/// Process-local store. Aggregates vanish on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<StatKey, DailyStatAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateStore for MemoryStore {
    fn increment(
        &self,
        key: &StatKey,
        class: VehicleClass,
        speed_kmh: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        records
            .entry(key.clone())
            .or_insert_with(|| DailyStatAggregate::empty(key, at))
            .apply(class, speed_kmh);
        Ok(())
    }

    fn load(&self, key: &StatKey) -> Result<Option<DailyStatAggregate>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        Ok(records.get(key).cloned())
    }
}
