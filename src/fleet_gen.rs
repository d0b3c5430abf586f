//! Synthetic driver fleet and counter-bid generator.
//!
//! Deterministic: same seed, same pings. Used by the load benches, replay tests and demos.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::dispatch::DispatchCoordinator;
use crate::error::DispatchError;
use crate::types::{Coordinate, LocationPing, Timestamp, UserId};

/// Meters per degree of latitude, close enough for city-scale offsets.
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub seed: u64,
    pub center: Coordinate,
    /// Drivers are placed uniformly in a square of this half-width around `center`.
    pub spread_m: f64,
    pub num_drivers: usize,
    /// Probability a driver is online.
    pub available_ratio: f64,
    /// Timestamp stamped on every ping.
    pub timestamp: Timestamp,
    /// First driver id; ids are consecutive.
    pub first_driver_id: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            center: Coordinate::new(37.77, -122.41),
            spread_m: 5_000.0,
            num_drivers: 1_000,
            available_ratio: 0.9,
            timestamp: 0,
            first_driver_id: 1_000,
        }
    }
}

pub struct FleetGenerator {
    rng: StdRng,
    config: FleetConfig,
    next_driver: u64,
}

impl FleetGenerator {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            next_driver: config.first_driver_id,
            config,
        }
    }

    pub fn next_ping(&mut self) -> LocationPing {
        let driver_id = UserId(self.next_driver);
        self.next_driver += 1;
        let spread = self.config.spread_m;
        let dy = self.rng.gen_range(-spread..=spread);
        let dx = self.rng.gen_range(-spread..=spread);
        let center = self.config.center;
        let lat = center.lat + dy / METERS_PER_DEGREE;
        let lng = center.lng + dx / (METERS_PER_DEGREE * center.lat.to_radians().cos());
        LocationPing {
            driver_id,
            lat,
            lng,
            timestamp: self.config.timestamp,
            available: self.rng.gen::<f64>() < self.config.available_ratio,
        }
    }

    pub fn take_pings(&mut self, n: usize) -> Vec<LocationPing> {
        (0..n).map(|_| self.next_ping()).collect()
    }

    pub fn all_pings(&mut self) -> Vec<LocationPing> {
        self.take_pings(self.config.num_drivers)
    }

    /// Random counter-bid inside `[min_ratio, 1.0] x ask`, rounded up to the cent so it
    /// never falls under the floor.
    pub fn counter_amount(&mut self, ask: Decimal, min_ratio: Decimal) -> Decimal {
        let steps = self.rng.gen_range(0..=100u32);
        let span = Decimal::ONE - min_ratio;
        let ratio = min_ratio + span * Decimal::new(steps as i64, 2);
        (ask * ratio)
            .round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
            .min(ask)
    }
}

/// Feeds pings into the dispatcher's geo index. Returns how many were applied.
pub fn replay_into_dispatcher(
    dispatcher: &DispatchCoordinator,
    pings: impl IntoIterator<Item = LocationPing>,
) -> Result<usize, DispatchError> {
    let mut applied = 0;
    for ping in pings {
        dispatcher.apply_ping(&ping)?;
        applied += 1;
    }
    Ok(applied)
}
