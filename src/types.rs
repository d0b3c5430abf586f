//! Core types and IDs for the ride auction engine.
//!
//! All identifiers are newtype wrappers. Money is [`Decimal`] (never floating point);
//! coordinates are WGS84 degrees. Timestamps are milliseconds since the Unix epoch.

use rust_decimal::Decimal;
use std::fmt;

use crate::error::DispatchError;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Ride request identifier (assigned by the dispatcher).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct RideRequestId(pub u64);

/// Bid identifier (assigned by the dispatcher, unique across rides).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct BidId(pub u64);

/// Rider or driver identifier. Supplied by collaborators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for RideRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geographic point in degrees.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Rejects non-finite values and points outside [-90, 90] x [-180, 180].
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(DispatchError::InvalidCoordinate(format!(
                "non-finite coordinate ({}, {})",
                self.lat, self.lng
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(DispatchError::InvalidCoordinate(format!(
                "coordinate out of range ({}, {})",
                self.lat, self.lng
            )));
        }
        Ok(())
    }
}

/// Which side of the ride a bidder is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Rider,
    Driver,
}

/// Bid status. Transitions are recorded as ledger entries, never overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Superseded,
}

/// Ride request lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideState {
    Open,
    Bidding,
    Matched,
    InProgress,
    Completed,
    Cancelled,
}

impl RideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideState::Open => "open",
            RideState::Bidding => "bidding",
            RideState::Matched => "matched",
            RideState::InProgress => "in_progress",
            RideState::Completed => "completed",
            RideState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideState::Completed | RideState::Cancelled)
    }

    /// Lifecycle table. Cancellation is allowed from any state before `InProgress`.
    pub fn can_transition_to(&self, next: RideState) -> bool {
        use RideState::*;
        matches!(
            (self, next),
            (Open, Bidding)
                | (Bidding, Matched)
                | (Matched, InProgress)
                | (InProgress, Completed)
                | (Open, Cancelled)
                | (Bidding, Cancelled)
                | (Matched, Cancelled)
        )
    }
}

impl fmt::Display for RideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a ride request was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CancelReason {
    RiderCancelled,
    NoDrivers,
    DriverTimeout,
    AdminAction,
}

impl CancelReason {
    /// System-issued reasons cannot be requested through [`crate::DispatchCoordinator::cancel`].
    pub fn is_system_issued(&self) -> bool {
        matches!(self, CancelReason::NoDrivers | CancelReason::DriverTimeout)
    }
}

/// Driver location ping as produced by the GPS polling collaborator.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LocationPing {
    pub driver_id: UserId,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: Timestamp,
    pub available: bool,
}

impl LocationPing {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }
}

/// Permitted window for a driver counter-bid against the rider's current ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BidBounds {
    pub ask: Decimal,
    pub min: Decimal,
    pub max: Decimal,
    /// Pre-filled counter offer (0.9 x ask, clamped into the window).
    pub suggested: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_validate_rejects_out_of_range_and_nan() {
        assert!(Coordinate::new(37.77, -122.41).validate().is_ok());
        assert!(Coordinate::new(90.0, 180.0).validate().is_ok());
        assert!(Coordinate::new(91.0, 0.0).validate().is_err());
        assert!(Coordinate::new(0.0, -180.5).validate().is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn lifecycle_table_matches_documented_transitions() {
        use RideState::*;
        assert!(Open.can_transition_to(Bidding));
        assert!(Bidding.can_transition_to(Matched));
        assert!(Matched.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Matched.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Cancelled));
        assert!(!Open.can_transition_to(Matched));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Bidding));
    }

    #[test]
    fn ride_state_serializes_snake_case() {
        let json = serde_json::to_string(&RideState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
