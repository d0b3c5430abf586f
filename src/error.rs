//! Error taxonomy for the dispatch core.
//!
//! Every variant except [`DispatchError::InvariantViolation`] is an expected, recoverable
//! condition surfaced synchronously to the caller.

use crate::types::{RideRequestId, RideState, UserId};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("ride {0} is not accepting bids")]
    RideClosed(RideRequestId),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("ride {0} already has an accepted bid")]
    AlreadyResolved(RideRequestId),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RideState, to: RideState },
    #[error("stale position update for driver {0}")]
    StaleUpdate(UserId),
    /// Matching or starting a ride that was cancelled because no driver was nearby. Ride
    /// creation itself reports that case as a cancelled ride, not as this error.
    #[error("no drivers available")]
    NoDrivers,
    #[error("driver did not start ride {0} within the grace period")]
    DriverTimeout(RideRequestId),
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("internal consistency violation: {0}")]
    InvariantViolation(String),
}

impl DispatchError {
    /// Stable machine-readable code for collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidAmount(_) => "invalid_amount",
            DispatchError::RideClosed(_) => "ride_closed",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Unauthorized(_) => "unauthorized",
            DispatchError::AlreadyResolved(_) => "already_resolved",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::StaleUpdate(_) => "stale_update",
            DispatchError::NoDrivers => "no_drivers",
            DispatchError::DriverTimeout(_) => "driver_timeout",
            DispatchError::InvalidCoordinate(_) => "invalid_coordinate",
            DispatchError::InvalidConfig(_) => "invalid_config",
            DispatchError::InvariantViolation(_) => "invariant_violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_messages() {
        let err = DispatchError::AlreadyResolved(RideRequestId(7));
        assert_eq!(err.code(), "already_resolved");
        assert_eq!(err.to_string(), "ride 7 already has an accepted bid");

        let err = DispatchError::InvalidTransition {
            from: RideState::Open,
            to: RideState::Matched,
        };
        assert_eq!(err.to_string(), "invalid transition from open to matched");
    }
}
