//! Driver geo index: H3 cell buckets behind sharded read/write locks.
//!
//! Each position lives in the bucket of its H3 cell. A proximity query walks the grid disk
//! around the query cell, so cost depends on the (capped) radius, not on fleet size.
//! Readers only take cell-shard read locks; a writer holds its driver-shard lock for the
//! whole update so updates for one driver are serialized.
//!
//! Staleness is evaluated lazily at query time; stale entries stay in the index for audit.

use h3o::{CellIndex, LatLng, Resolution};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::types::{Coordinate, LocationPing, Timestamp, UserId};

const SHARDS: usize = 64;
const EARTH_RADIUS_M: f64 = 6_371_000.0;
const RING_MARGIN: f64 = 0.8;
/// Largest grid disk a query at the maximum radius may walk, at average cell size.
const MAX_DISK_CELLS: u64 = 50_000;

/// Last known position of a driver.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DriverPosition {
    pub driver_id: UserId,
    pub coordinate: Coordinate,
    pub updated_at: Timestamp,
    pub available: bool,
}

/// One proximity query hit.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NearbyDriver {
    pub driver_id: UserId,
    pub distance_m: f64,
}

type CellBucket = HashMap<UserId, DriverPosition>;

#[derive(Debug)]
pub struct GeoIndex {
    resolution: Resolution,
    staleness_ms: u64,
    max_radius_m: f64,
    /// Hard cap on query rings; local cells can be smaller than the average one.
    max_rings: u32,
    clock: Arc<dyn Clock>,
    /// driver -> (cell, position); sharded by driver id.
    drivers: Vec<RwLock<HashMap<UserId, (CellIndex, DriverPosition)>>>,
    /// cell -> drivers in that cell; sharded by cell hash.
    cells: Vec<RwLock<HashMap<CellIndex, CellBucket>>>,
}

impl GeoIndex {
    pub fn new(
        resolution: u8,
        staleness: Duration,
        max_radius_m: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        let resolution = Resolution::try_from(resolution).map_err(|e| {
            DispatchError::InvalidConfig(format!("invalid H3 resolution: {}", e))
        })?;
        if !(max_radius_m.is_finite() && max_radius_m > 0.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "max search radius must be finite and positive, got {}",
                max_radius_m
            )));
        }
        let rings = rings_for(resolution.edge_length_m(), max_radius_m);
        let cells = disk_size(rings);
        if cells > MAX_DISK_CELLS {
            return Err(DispatchError::InvalidConfig(format!(
                "radius {}m at H3 resolution {} spans {} cells (limit {})",
                max_radius_m,
                u8::from(resolution),
                cells,
                MAX_DISK_CELLS
            )));
        }
        Ok(Self {
            resolution,
            staleness_ms: staleness.as_millis() as u64,
            max_radius_m,
            max_rings: rings.saturating_mul(2),
            clock,
            drivers: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            cells: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        })
    }

    /// Records a new position for `driver_id`, keeping its availability flag (new drivers
    /// start available). Fails with `StaleUpdate` if `timestamp` is older than the stored one.
    pub fn upsert_position(
        &self,
        driver_id: UserId,
        coordinate: Coordinate,
        timestamp: Timestamp,
    ) -> Result<DriverPosition, DispatchError> {
        self.store(driver_id, timestamp, |previous| {
            Ok(DriverPosition {
                driver_id,
                coordinate,
                updated_at: timestamp,
                available: previous.map(|p| p.available).unwrap_or(true),
            })
        })
    }

    /// Applies a full location ping, including the availability flag.
    pub fn apply_ping(&self, ping: &LocationPing) -> Result<DriverPosition, DispatchError> {
        self.store(ping.driver_id, ping.timestamp, |_| {
            Ok(DriverPosition {
                driver_id: ping.driver_id,
                coordinate: ping.coordinate(),
                updated_at: ping.timestamp,
                available: ping.available,
            })
        })
    }

    /// Online/offline switch. The driver must have reported a position before. The location
    /// timestamp is left untouched, so a toggle never makes a stale position fresh again.
    pub fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
    ) -> Result<DriverPosition, DispatchError> {
        let mut directory = self.drivers[driver_shard(driver_id)].write();
        let (cell, position) = directory
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {}", driver_id)))?;
        position.available = available;
        let (cell, position) = (*cell, *position);
        if let Some(entry) = self.cells[cell_shard(cell)]
            .write()
            .get_mut(&cell)
            .and_then(|bucket| bucket.get_mut(&driver_id))
        {
            entry.available = available;
        }
        debug!(
            "availability stored driver_id={} available={} updated_at={}",
            driver_id, available, position.updated_at
        );
        Ok(position)
    }

    fn store<F>(
        &self,
        driver_id: UserId,
        timestamp: Timestamp,
        build: F,
    ) -> Result<DriverPosition, DispatchError>
    where
        F: FnOnce(Option<&DriverPosition>) -> Result<DriverPosition, DispatchError>,
    {
        let mut directory = self.drivers[driver_shard(driver_id)].write();
        let previous = directory.get(&driver_id).copied();
        if let Some((_, prev)) = &previous {
            if timestamp < prev.updated_at {
                warn!(
                    "stale position rejected driver_id={} timestamp={} stored={}",
                    driver_id, timestamp, prev.updated_at
                );
                return Err(DispatchError::StaleUpdate(driver_id));
            }
        }
        let position = build(previous.as_ref().map(|(_, p)| p))?;
        let cell = self.cell_for(position.coordinate)?;

        if let Some((old_cell, _)) = previous {
            if old_cell != cell {
                let mut shard = self.cells[cell_shard(old_cell)].write();
                if let Some(bucket) = shard.get_mut(&old_cell) {
                    bucket.remove(&driver_id);
                    if bucket.is_empty() {
                        shard.remove(&old_cell);
                    }
                }
            }
        }
        self.cells[cell_shard(cell)]
            .write()
            .entry(cell)
            .or_default()
            .insert(driver_id, position);
        directory.insert(driver_id, (cell, position));
        debug!(
            "position stored driver_id={} lat={} lng={} available={}",
            driver_id, position.coordinate.lat, position.coordinate.lng, position.available
        );
        Ok(position)
    }

    /// Available, fresh drivers within `radius_m` of `point`, nearest first, ties broken by
    /// driver id ascending. The radius is capped at the configured maximum.
    pub fn query_nearby(
        &self,
        point: Coordinate,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>, DispatchError> {
        if !(radius_m >= 0.0) {
            return Err(DispatchError::InvalidCoordinate(format!(
                "radius must be non-negative, got {}",
                radius_m
            )));
        }
        let radius_m = radius_m.min(self.max_radius_m);
        let origin = self.cell_for(point)?;
        let now = self.clock.now_millis();

        let mut found = Vec::new();
        for cell in origin.grid_disk::<Vec<_>>(self.ring_count(origin, radius_m)) {
            let shard = self.cells[cell_shard(cell)].read();
            let Some(bucket) = shard.get(&cell) else {
                continue;
            };
            for position in bucket.values() {
                if !position.available || self.is_stale(position, now) {
                    continue;
                }
                let distance_m = haversine_m(point, position.coordinate);
                if distance_m <= radius_m {
                    found.push(NearbyDriver {
                        driver_id: position.driver_id,
                        distance_m,
                    });
                }
            }
        }
        found.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        found.truncate(limit);
        Ok(found)
    }

    /// Stored position, stale or not.
    pub fn position(&self, driver_id: UserId) -> Option<DriverPosition> {
        self.drivers[driver_shard(driver_id)]
            .read()
            .get(&driver_id)
            .map(|(_, p)| *p)
    }

    pub fn is_stale(&self, position: &DriverPosition, now: Timestamp) -> bool {
        now.saturating_sub(position.updated_at) > self.staleness_ms
    }

    pub fn len(&self) -> usize {
        self.drivers.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell_for(&self, coordinate: Coordinate) -> Result<CellIndex, DispatchError> {
        coordinate.validate()?;
        let ll = LatLng::new(coordinate.lat, coordinate.lng)
            .map_err(|e| DispatchError::InvalidCoordinate(e.to_string()))?;
        Ok(ll.to_cell(self.resolution))
    }

    /// Grid distance covering `radius_m` around any point of `origin`. Uses the local cell
    /// size (cells shrink and stretch across the globe) with a margin for hexagon distortion.
    fn ring_count(&self, origin: CellIndex, radius_m: f64) -> u32 {
        let edge = (2.0 * origin.area_m2() / (3.0 * 3f64.sqrt())).sqrt();
        rings_for(edge, radius_m).min(self.max_rings)
    }
}

fn rings_for(edge_m: f64, radius_m: f64) -> u32 {
    let spacing = edge_m * 3f64.sqrt() * RING_MARGIN;
    ((radius_m + 2.0 * edge_m) / spacing).ceil() as u32 + 1
}

/// Cells in a grid disk of `k` rings.
fn disk_size(k: u32) -> u64 {
    let k = u64::from(k);
    1 + 3 * k * (k + 1)
}

fn driver_shard(driver_id: UserId) -> usize {
    (driver_id.0 % SHARDS as u64) as usize
}

// Low bits of an H3 index are constant at coarse resolutions, so hash instead of masking.
fn cell_shard(cell: CellIndex) -> usize {
    let mut hasher = DefaultHasher::new();
    cell.hash(&mut hasher);
    (hasher.finish() % SHARDS as u64) as usize
}

/// Great-circle distance in meters.
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}
