//! Ride request lifecycle (the matching state machine).
//!
//! `open -> bidding -> matched -> in_progress -> completed`, with `cancelled` reachable from
//! any state before `in_progress`. Every transition is appended to [`RideRequest::history`].
//! Callers serialize access per ride; this type does no locking of its own.

use rust_decimal::Decimal;

use crate::error::DispatchError;
use crate::types::{BidId, CancelReason, Coordinate, RideRequestId, RideState, Timestamp, UserId};

/// One recorded state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transition {
    pub from: RideState,
    pub to: RideState,
    pub at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cancellation {
    pub reason: CancelReason,
    /// True when the ride was already matched when it was cancelled.
    pub had_accepted_bid: bool,
    pub at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RideRequest {
    pub ride_request_id: RideRequestId,
    pub rider_id: UserId,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub requested_at: Timestamp,
    pub state: RideState,
    pub accepted_bid_id: Option<BidId>,
    /// Matched driver (the accepted bid's driver side).
    pub driver_id: Option<UserId>,
    /// Final fare, equal to the accepted bid's amount. Set on completion.
    pub settled_amount: Option<Decimal>,
    pub cancellation: Option<Cancellation>,
    pub history: Vec<Transition>,
}

impl RideRequest {
    /// New request in `open`.
    pub fn new(
        ride_request_id: RideRequestId,
        rider_id: UserId,
        pickup: Coordinate,
        destination: Coordinate,
        requested_at: Timestamp,
    ) -> Self {
        Self {
            ride_request_id,
            rider_id,
            pickup,
            destination,
            requested_at,
            state: RideState::Open,
            accepted_bid_id: None,
            driver_id: None,
            settled_amount: None,
            cancellation: None,
            history: Vec::new(),
        }
    }

    /// Fails with `InvalidTransition` if the lifecycle table forbids `current -> to`.
    pub fn ensure_transition(&self, to: RideState) -> Result<(), DispatchError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn transition(&mut self, to: RideState, at: Timestamp) -> Result<Transition, DispatchError> {
        self.ensure_transition(to)?;
        let t = Transition {
            from: self.state,
            to,
            at,
        };
        self.state = to;
        self.history.push(t);
        Ok(t)
    }

    pub fn open_bidding(&mut self, at: Timestamp) -> Result<Transition, DispatchError> {
        self.transition(RideState::Bidding, at)
    }

    /// Records the accepted bid. Only the bid ledger's acceptance path calls this.
    pub fn mark_matched(
        &mut self,
        bid_id: BidId,
        driver_id: UserId,
        at: Timestamp,
    ) -> Result<Transition, DispatchError> {
        let t = self.transition(RideState::Matched, at)?;
        self.accepted_bid_id = Some(bid_id);
        self.driver_id = Some(driver_id);
        Ok(t)
    }

    /// Driver "arrived / start" signal. Only the matched driver may start the ride.
    pub fn start(&mut self, driver_id: UserId, at: Timestamp) -> Result<Transition, DispatchError> {
        self.ensure_transition(RideState::InProgress)?;
        self.ensure_driver(driver_id)?;
        self.transition(RideState::InProgress, at)
    }

    /// "Ride ended" signal. Settles at `settled`, the accepted bid's amount.
    pub fn complete(
        &mut self,
        driver_id: UserId,
        settled: Decimal,
        at: Timestamp,
    ) -> Result<Transition, DispatchError> {
        self.ensure_transition(RideState::Completed)?;
        self.ensure_driver(driver_id)?;
        let t = self.transition(RideState::Completed, at)?;
        self.settled_amount = Some(settled);
        Ok(t)
    }

    pub fn cancel(&mut self, reason: CancelReason, at: Timestamp) -> Result<Transition, DispatchError> {
        let had_accepted_bid = self.accepted_bid_id.is_some();
        let t = self.transition(RideState::Cancelled, at)?;
        self.cancellation = Some(Cancellation {
            reason,
            had_accepted_bid,
            at,
        });
        Ok(t)
    }

    fn ensure_driver(&self, driver_id: UserId) -> Result<(), DispatchError> {
        if self.driver_id == Some(driver_id) {
            Ok(())
        } else {
            Err(DispatchError::Unauthorized(format!(
                "driver {} is not assigned to ride {}",
                driver_id, self.ride_request_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ride() -> RideRequest {
        RideRequest::new(
            RideRequestId(1),
            UserId(10),
            Coordinate::new(37.77, -122.41),
            Coordinate::new(37.80, -122.27),
            1_000,
        )
    }

    #[test]
    fn happy_path_records_history() {
        let mut r = ride();
        r.open_bidding(1).unwrap();
        r.mark_matched(BidId(5), UserId(20), 2).unwrap();
        r.start(UserId(20), 3).unwrap();
        r.complete(UserId(20), Decimal::new(1800, 2), 4).unwrap();

        assert_eq!(r.state, RideState::Completed);
        assert_eq!(r.accepted_bid_id, Some(BidId(5)));
        assert_eq!(r.settled_amount, Some(Decimal::new(1800, 2)));
        let states: Vec<RideState> = r.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                RideState::Bidding,
                RideState::Matched,
                RideState::InProgress,
                RideState::Completed
            ]
        );
    }

    #[test]
    fn matched_from_open_is_invalid_transition() {
        let mut r = ride();
        let err = r.mark_matched(BidId(1), UserId(20), 1).unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidTransition {
                from: RideState::Open,
                to: RideState::Matched
            }
        );
        assert!(r.accepted_bid_id.is_none());
    }

    #[test]
    fn wrong_driver_cannot_start() {
        let mut r = ride();
        r.open_bidding(1).unwrap();
        r.mark_matched(BidId(5), UserId(20), 2).unwrap();
        assert!(matches!(
            r.start(UserId(21), 3),
            Err(DispatchError::Unauthorized(_))
        ));
        assert_eq!(r.state, RideState::Matched);
    }

    #[test]
    fn cancel_after_match_records_accepted_bid() {
        let mut r = ride();
        r.open_bidding(1).unwrap();
        r.mark_matched(BidId(5), UserId(20), 2).unwrap();
        r.cancel(CancelReason::RiderCancelled, 3).unwrap();
        let c = r.cancellation.unwrap();
        assert!(c.had_accepted_bid);
        assert_eq!(c.reason, CancelReason::RiderCancelled);
    }

    #[test]
    fn cannot_cancel_in_progress_or_terminal() {
        let mut r = ride();
        r.open_bidding(1).unwrap();
        r.mark_matched(BidId(5), UserId(20), 2).unwrap();
        r.start(UserId(20), 3).unwrap();
        assert!(r.cancel(CancelReason::AdminAction, 4).is_err());

        let mut r = ride();
        r.cancel(CancelReason::NoDrivers, 1).unwrap();
        assert!(r.cancel(CancelReason::AdminAction, 2).is_err());
        assert!(!r.cancellation.unwrap().had_accepted_bid);
    }
}
