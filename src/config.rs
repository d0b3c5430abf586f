//! Engine configuration: defaults plus environment overrides.
//!
//! `MIN_COUNTER_RATIO`, `MATCH_GRACE_SECS`, `POSITION_STALENESS_SECS`, `SEARCH_RADIUS_M`,
//! `MAX_SEARCH_RADIUS_M`, `NEARBY_LIMIT`, `H3_RESOLUTION`, `EVENT_BUFFER`, `MIN_ASK`, `MAX_ASK`.

use log::warn;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DispatchError;

const MAX_H3_RESOLUTION: u8 = 15;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Lowest driver counter-bid as a fraction of the rider's ask (0 < ratio <= 1).
    pub min_counter_ratio: Decimal,
    /// How long a matched driver has to start the ride.
    pub match_grace: Duration,
    /// Positions older than this are skipped by proximity queries.
    pub position_staleness: Duration,
    /// Radius used to find drivers when a ride request is created.
    pub search_radius_m: f64,
    /// Upper bound applied to every proximity query radius.
    pub max_search_radius_m: f64,
    pub nearby_limit: usize,
    pub h3_resolution: u8,
    /// Per-ride event channel capacity.
    pub event_buffer: usize,
    pub min_ask: Option<Decimal>,
    pub max_ask: Option<Decimal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_counter_ratio: Decimal::new(5, 1),
            match_grace: Duration::from_secs(300),
            position_staleness: Duration::from_secs(60),
            search_radius_m: 3_000.0,
            max_search_radius_m: 10_000.0,
            nearby_limit: 20,
            h3_resolution: 9,
            event_buffer: 256,
            min_ask: None,
            max_ask: None,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn radius_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f64> {
    match parse_var::<f64>(lookup, key) {
        Some(r) if r.is_finite() && r > 0.0 => Some(r),
        Some(r) => {
            warn!("ignoring {}={} (must be finite and positive)", key, r);
            None
        }
        None => None,
    }
}

impl EngineConfig {
    /// Defaults overridden by any parseable environment variable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source. Out-of-range values
    /// fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let min_counter_ratio = match parse_var::<Decimal>(&lookup, "MIN_COUNTER_RATIO") {
            Some(r) if r > Decimal::ZERO && r <= Decimal::ONE => r,
            Some(r) => {
                warn!("ignoring MIN_COUNTER_RATIO={} (must be in (0, 1])", r);
                defaults.min_counter_ratio
            }
            None => defaults.min_counter_ratio,
        };

        let max_search_radius_m =
            radius_var(&lookup, "MAX_SEARCH_RADIUS_M").unwrap_or(defaults.max_search_radius_m);
        let mut search_radius_m =
            radius_var(&lookup, "SEARCH_RADIUS_M").unwrap_or(defaults.search_radius_m);
        if search_radius_m > max_search_radius_m {
            warn!(
                "SEARCH_RADIUS_M={} exceeds MAX_SEARCH_RADIUS_M={}; using the maximum",
                search_radius_m, max_search_radius_m
            );
            search_radius_m = max_search_radius_m;
        }

        let h3_resolution = match parse_var::<u8>(&lookup, "H3_RESOLUTION") {
            Some(r) if r <= MAX_H3_RESOLUTION => r,
            Some(r) => {
                warn!(
                    "ignoring H3_RESOLUTION={} (must be at most {})",
                    r, MAX_H3_RESOLUTION
                );
                defaults.h3_resolution
            }
            None => defaults.h3_resolution,
        };

        Self {
            min_counter_ratio,
            match_grace: parse_var::<u64>(&lookup, "MATCH_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.match_grace),
            position_staleness: parse_var::<u64>(&lookup, "POSITION_STALENESS_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.position_staleness),
            search_radius_m,
            max_search_radius_m,
            nearby_limit: parse_var::<usize>(&lookup, "NEARBY_LIMIT")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.nearby_limit),
            h3_resolution,
            event_buffer: parse_var::<usize>(&lookup, "EVENT_BUFFER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.event_buffer),
            min_ask: parse_var(&lookup, "MIN_ASK"),
            max_ask: parse_var(&lookup, "MAX_ASK"),
        }
    }

    /// Rejects settings the engine cannot run with. Grid-disk size limits for the chosen
    /// resolution are enforced by the geo index on construction.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(self.min_counter_ratio > Decimal::ZERO && self.min_counter_ratio <= Decimal::ONE) {
            return Err(DispatchError::InvalidConfig(format!(
                "min counter ratio {} outside (0, 1]",
                self.min_counter_ratio
            )));
        }
        for (name, radius) in [
            ("search radius", self.search_radius_m),
            ("max search radius", self.max_search_radius_m),
        ] {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(DispatchError::InvalidConfig(format!(
                    "{} must be finite and positive, got {}",
                    name, radius
                )));
            }
        }
        if self.search_radius_m > self.max_search_radius_m {
            return Err(DispatchError::InvalidConfig(format!(
                "search radius {} exceeds max search radius {}",
                self.search_radius_m, self.max_search_radius_m
            )));
        }
        if self.h3_resolution > MAX_H3_RESOLUTION {
            return Err(DispatchError::InvalidConfig(format!(
                "H3 resolution {} above {}",
                self.h3_resolution, MAX_H3_RESOLUTION
            )));
        }
        if self.event_buffer == 0 {
            return Err(DispatchError::InvalidConfig("event buffer must be non-zero".into()));
        }
        if let (Some(min), Some(max)) = (self.min_ask, self.max_ask) {
            if min > max {
                return Err(DispatchError::InvalidConfig(format!(
                    "min ask {} above max ask {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn default_mirrors_half_to_full_counter_window() {
        let config = EngineConfig::default();
        assert_eq!(config.min_counter_ratio, Decimal::new(5, 1));
        assert!(config.search_radius_m <= config.max_search_radius_m);
        assert!(config.min_ask.is_none() && config.max_ask.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_variables_fall_back_to_defaults() {
        let defaults = EngineConfig::default();
        let config = from_vars(&[
            ("SEARCH_RADIUS_M", "NaN"),
            ("MAX_SEARCH_RADIUS_M", "-10"),
            ("H3_RESOLUTION", "16"),
            ("MIN_COUNTER_RATIO", "1.5"),
            ("NEARBY_LIMIT", "0"),
            ("EVENT_BUFFER", "0"),
        ]);
        assert_eq!(config.search_radius_m, defaults.search_radius_m);
        assert_eq!(config.max_search_radius_m, defaults.max_search_radius_m);
        assert_eq!(config.h3_resolution, defaults.h3_resolution);
        assert_eq!(config.min_counter_ratio, defaults.min_counter_ratio);
        assert_eq!(config.nearby_limit, defaults.nearby_limit);
        assert_eq!(config.event_buffer, defaults.event_buffer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn search_radius_capped_at_max() {
        let config = from_vars(&[("SEARCH_RADIUS_M", "5000"), ("MAX_SEARCH_RADIUS_M", "2000")]);
        assert_eq!(config.search_radius_m, 2_000.0);
        assert_eq!(config.max_search_radius_m, 2_000.0);

        let config = from_vars(&[("H3_RESOLUTION", " 7 "), ("MIN_ASK", "5.00")]);
        assert_eq!(config.h3_resolution, 7);
        assert_eq!(config.min_ask, Some(Decimal::new(500, 2)));
    }

    #[test]
    fn validate_rejects_hand_built_bad_settings() {
        let bad = [
            EngineConfig {
                search_radius_m: f64::NAN,
                ..EngineConfig::default()
            },
            EngineConfig {
                search_radius_m: 20_000.0,
                ..EngineConfig::default()
            },
            EngineConfig {
                h3_resolution: 16,
                ..EngineConfig::default()
            },
            EngineConfig {
                min_counter_ratio: Decimal::ZERO,
                ..EngineConfig::default()
            },
            EngineConfig {
                min_ask: Some(Decimal::new(50, 0)),
                max_ask: Some(Decimal::new(5, 0)),
                ..EngineConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(DispatchError::InvalidConfig(_))));
        }
    }
}
