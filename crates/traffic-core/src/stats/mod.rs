//! Per-camera daily vehicle statistics.

mod sqlite;
mod store;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

pub use sqlite::SqliteStore;
pub use store::{AggregateStore, DailyStatAggregate, MemoryStore, StatKey};

use crate::error::StoreError;

/// Vehicle categories that contribute to aggregates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    /// Map a COCO class id. Anything outside the monitored set is `None`.
    pub fn from_class_id(class_id: i64) -> Option<Self> {
        match class_id {
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }
}

/// COCO ids requested from the tracker.
pub const MONITORED_CLASS_IDS: [i64; 4] = [2, 3, 5, 7];

/// Query result served to clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DailyStats {
    pub total_car: u64,
    pub total_motorcycle: u64,
    pub total_bus: u64,
    pub total_truck: u64,
    pub average_speed: f64,
}

impl DailyStats {
    fn from_aggregate(aggregate: &DailyStatAggregate) -> Self {
        Self {
            total_car: aggregate.total_car,
            total_motorcycle: aggregate.total_motorcycle,
            total_bus: aggregate.total_bus,
            total_truck: aggregate.total_truck,
            average_speed: (aggregate.average_speed() * 100.0).round() / 100.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total_car + self.total_motorcycle + self.total_bus + self.total_truck
    }
}

/// Shared entry point for recording crossings and reading daily totals.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn AggregateStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Count one crossing of `class_id` at `speed_kmh`.
    ///
    /// Unmonitored classes are ignored and return `Ok(None)`. Non-finite
    /// speeds still count the vehicle but stay out of the average.
    pub fn record(
        &self,
        camera_id: &str,
        date: NaiveDate,
        class_id: i64,
        speed_kmh: f64,
    ) -> Result<Option<VehicleClass>, StoreError> {
        self.record_at(camera_id, date, class_id, speed_kmh, Utc::now())
    }

    pub fn record_at(
        &self,
        camera_id: &str,
        date: NaiveDate,
        class_id: i64,
        speed_kmh: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<VehicleClass>, StoreError> {
        let Some(class) = VehicleClass::from_class_id(class_id) else {
            return Ok(None);
        };
        let speed = speed_kmh.is_finite().then_some(speed_kmh);
        self.store
            .increment(&StatKey::new(camera_id, date), class, speed, at)?;
        Ok(Some(class))
    }

    /// Snapshot for `(camera_id, date)`; zeros when nothing was recorded.
    pub fn query(&self, camera_id: &str, date: NaiveDate) -> Result<DailyStats, StoreError> {
        let aggregate = self.store.load(&StatKey::new(camera_id, date))?;
        Ok(aggregate
            .as_ref()
            .map(DailyStats::from_aggregate)
            .unwrap_or_default())
    }
}
