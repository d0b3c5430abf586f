//! Per-ride bid ledger.
//!
//! Bids are immutable once submitted. Status changes are appended to the ledger log as
//! [`LedgerEntry::StatusChanged`] records; the status column returned by [`BidLedger::iter`]
//! is derived from that log. Submission order is the order of the log.
//!
//! Amount rules: a rider ask is any positive cent amount (optionally inside the configured
//! min/max ask). A driver counter-bid must fall within
//! `[floor_cents(ask * min_counter_ratio), ask]` against the rider's current ask.

use log::{error, info};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

use crate::error::DispatchError;
use crate::ride::RideRequest;
use crate::types::{BidBounds, BidId, BidStatus, RideRequestId, RideState, Role, Timestamp, UserId};

/// A priced offer against a ride request.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub ride_request_id: RideRequestId,
    pub bidder_id: UserId,
    pub role: Role,
    pub amount: Decimal,
    pub submitted_at: Timestamp,
    pub status: BidStatus,
}

/// Append-only audit record.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Submitted {
        bid: Bid,
    },
    StatusChanged {
        bid_id: BidId,
        from: BidStatus,
        to: BidStatus,
        at: Timestamp,
    },
}

/// Amount limits applied on submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BidRules {
    pub min_counter_ratio: Decimal,
    pub min_ask: Option<Decimal>,
    pub max_ask: Option<Decimal>,
}

impl Default for BidRules {
    fn default() -> Self {
        Self {
            min_counter_ratio: Decimal::new(5, 1),
            min_ask: None,
            max_ask: None,
        }
    }
}

/// Driver counter-bid window `(min, max)` for `ask`. The floor is rounded down to cents.
pub fn counter_window(ask: Decimal, ratio: Decimal) -> (Decimal, Decimal) {
    let min = (ask * ratio).round_dp_with_strategy(2, RoundingStrategy::ToNegativeInfinity);
    (min, ask)
}

/// Pre-filled driver counter: 90% of the ask, to the cent, clamped into the window.
pub fn suggested_counter(ask: Decimal, ratio: Decimal) -> Decimal {
    let (min, max) = counter_window(ask, ratio);
    (ask * Decimal::new(9, 1))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .max(min)
        .min(max)
}

#[derive(Debug, Clone)]
pub struct BidLedger {
    ride_request_id: RideRequestId,
    rules: BidRules,
    /// As submitted; `status` is always `Pending` here.
    submissions: Vec<Bid>,
    statuses: Vec<BidStatus>,
    index: HashMap<BidId, usize>,
    log: Vec<LedgerEntry>,
    accepted: Option<BidId>,
    /// Position of the rider's current ask in `submissions`.
    current_ask: Option<usize>,
}

impl BidLedger {
    pub fn new(ride_request_id: RideRequestId, rules: BidRules) -> Self {
        Self {
            ride_request_id,
            rules,
            submissions: Vec::new(),
            statuses: Vec::new(),
            index: HashMap::new(),
            log: Vec::new(),
            accepted: None,
            current_ask: None,
        }
    }

    /// Rebuilds a ledger by replaying a persisted log. Fails if the log does not describe a
    /// consistent sequence of submissions and status changes for this ride.
    pub fn replay(
        ride_request_id: RideRequestId,
        rules: BidRules,
        log: &[LedgerEntry],
    ) -> Result<Self, DispatchError> {
        let corrupt = |what: String| {
            DispatchError::InvariantViolation(format!(
                "ledger log of ride {}: {}",
                ride_request_id, what
            ))
        };
        let mut ledger = Self::new(ride_request_id, rules);
        for entry in log {
            match entry {
                LedgerEntry::Submitted { bid } => {
                    if bid.ride_request_id != ride_request_id
                        || ledger.index.contains_key(&bid.bid_id)
                    {
                        return Err(corrupt(format!(
                            "unexpected submission of bid {}",
                            bid.bid_id
                        )));
                    }
                    let pos = ledger.submissions.len();
                    ledger.submissions.push(Bid {
                        status: BidStatus::Pending,
                        ..bid.clone()
                    });
                    ledger.statuses.push(BidStatus::Pending);
                    ledger.index.insert(bid.bid_id, pos);
                    if bid.role == Role::Rider {
                        ledger.current_ask = Some(pos);
                    }
                }
                LedgerEntry::StatusChanged { bid_id, from, to, .. } => {
                    let pos = *ledger.index.get(bid_id).ok_or_else(|| {
                        corrupt(format!("status change for unknown bid {}", bid_id))
                    })?;
                    if ledger.statuses[pos] != *from {
                        return Err(corrupt(format!(
                            "bid {} changes from {:?} but is {:?}",
                            bid_id, from, ledger.statuses[pos]
                        )));
                    }
                    if *to == BidStatus::Accepted {
                        if ledger.accepted.is_some() {
                            return Err(corrupt(format!("second accepted bid {}", bid_id)));
                        }
                        ledger.accepted = Some(*bid_id);
                    }
                    ledger.statuses[pos] = *to;
                }
            }
            ledger.log.push(entry.clone());
        }
        Ok(ledger)
    }

    /// Validates and appends a pending bid.
    ///
    /// A new rider ask supersedes the previous pending ask; a driver's new counter
    /// supersedes that driver's own pending counter.
    pub fn submit_bid(
        &mut self,
        ride: &RideRequest,
        bid_id: BidId,
        bidder_id: UserId,
        role: Role,
        amount: Decimal,
        timestamp: Timestamp,
    ) -> Result<Bid, DispatchError> {
        if ride.state != RideState::Bidding {
            return Err(DispatchError::RideClosed(self.ride_request_id));
        }
        match role {
            Role::Rider if bidder_id != ride.rider_id => {
                return Err(DispatchError::Unauthorized(format!(
                    "user {} is not the rider of ride {}",
                    bidder_id, self.ride_request_id
                )));
            }
            Role::Driver if bidder_id == ride.rider_id => {
                return Err(DispatchError::Unauthorized(format!(
                    "rider {} cannot counter-bid on own ride",
                    bidder_id
                )));
            }
            _ => {}
        }
        self.validate_amount(role, amount)?;

        let superseded: Vec<usize> = match role {
            Role::Rider => self.current_ask.into_iter().collect(),
            Role::Driver => (0..self.submissions.len())
                .filter(|&i| {
                    let b = &self.submissions[i];
                    b.role == Role::Driver
                        && b.bidder_id == bidder_id
                        && self.statuses[i] == BidStatus::Pending
                })
                .collect(),
        };

        let submitted_at = self
            .submissions
            .last()
            .map(|b| timestamp.max(b.submitted_at))
            .unwrap_or(timestamp);
        for i in superseded {
            self.set_status(i, BidStatus::Superseded, submitted_at);
        }

        let bid = Bid {
            bid_id,
            ride_request_id: self.ride_request_id,
            bidder_id,
            role,
            amount,
            submitted_at,
            status: BidStatus::Pending,
        };
        let pos = self.submissions.len();
        self.submissions.push(bid.clone());
        self.statuses.push(BidStatus::Pending);
        self.index.insert(bid_id, pos);
        self.log.push(LedgerEntry::Submitted { bid: bid.clone() });
        if role == Role::Rider {
            self.current_ask = Some(pos);
        }
        info!(
            "bid submitted ride_id={} bid_id={} bidder_id={} role={:?} amount={}",
            self.ride_request_id, bid_id, bidder_id, role, amount
        );
        Ok(bid)
    }

    pub(crate) fn validate_amount(&self, role: Role, amount: Decimal) -> Result<(), DispatchError> {
        if amount <= Decimal::ZERO {
            return Err(DispatchError::InvalidAmount(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if amount.round_dp(2) != amount {
            return Err(DispatchError::InvalidAmount(format!(
                "amount {} has sub-cent precision",
                amount
            )));
        }
        match role {
            Role::Rider => {
                if let Some(min) = self.rules.min_ask {
                    if amount < min {
                        return Err(DispatchError::InvalidAmount(format!(
                            "ask {} below minimum {}",
                            amount, min
                        )));
                    }
                }
                if let Some(max) = self.rules.max_ask {
                    if amount > max {
                        return Err(DispatchError::InvalidAmount(format!(
                            "ask {} above maximum {}",
                            amount, max
                        )));
                    }
                }
            }
            Role::Driver => {
                let ask = self.current_ask().ok_or_else(|| {
                    DispatchError::InvalidAmount("no rider ask to counter".into())
                })?;
                let (min, max) = counter_window(ask, self.rules.min_counter_ratio);
                if amount < min || amount > max {
                    return Err(DispatchError::InvalidAmount(format!(
                        "counter-bid {} outside [{}, {}]",
                        amount, min, max
                    )));
                }
            }
        }
        Ok(())
    }

    /// Accepts `bid_id` on behalf of `actor_id`, the counterparty of the bidder.
    ///
    /// All other pending bids become superseded. The caller is responsible for moving the
    /// ride to `matched` inside the same critical section.
    pub fn accept_bid(
        &mut self,
        ride: &RideRequest,
        bid_id: BidId,
        actor_id: UserId,
        timestamp: Timestamp,
    ) -> Result<Bid, DispatchError> {
        let pos = *self.index.get(&bid_id).ok_or_else(|| {
            DispatchError::NotFound(format!("bid {} on ride {}", bid_id, self.ride_request_id))
        })?;
        if self.accepted.is_some() {
            return Err(DispatchError::AlreadyResolved(self.ride_request_id));
        }
        ride.ensure_transition(RideState::Matched)?;

        let bid = &self.submissions[pos];
        let authorized = match bid.role {
            Role::Driver => actor_id == ride.rider_id,
            Role::Rider => actor_id != ride.rider_id,
        };
        if !authorized {
            return Err(DispatchError::Unauthorized(format!(
                "user {} cannot accept a {:?} bid on ride {}",
                actor_id, bid.role, self.ride_request_id
            )));
        }
        if self.statuses[pos] != BidStatus::Pending {
            return Err(DispatchError::NotFound(format!(
                "pending bid {} on ride {}",
                bid_id, self.ride_request_id
            )));
        }
        let prior = self.accepted_count();
        if prior != 0 {
            error!(
                "invariant violated ride_id={} accepted_bids={} before accept",
                self.ride_request_id, prior
            );
            return Err(DispatchError::InvariantViolation(format!(
                "ride {} already has {} accepted bids in its status column",
                self.ride_request_id, prior
            )));
        }

        self.set_status(pos, BidStatus::Accepted, timestamp);
        for i in 0..self.statuses.len() {
            if i != pos && self.statuses[i] == BidStatus::Pending {
                self.set_status(i, BidStatus::Superseded, timestamp);
            }
        }
        self.accepted = Some(bid_id);
        info!(
            "bid accepted ride_id={} bid_id={} actor_id={}",
            self.ride_request_id, bid_id, actor_id
        );
        Ok(self.bid_at(pos))
    }

    /// Marks every pending bid rejected (ride cancelled). Returns how many changed.
    pub fn reject_pending(&mut self, timestamp: Timestamp) -> usize {
        let pending: Vec<usize> = (0..self.statuses.len())
            .filter(|&i| self.statuses[i] == BidStatus::Pending)
            .collect();
        for &i in &pending {
            self.set_status(i, BidStatus::Rejected, timestamp);
        }
        pending.len()
    }

    fn set_status(&mut self, pos: usize, to: BidStatus, at: Timestamp) {
        let from = self.statuses[pos];
        if from == to {
            return;
        }
        self.statuses[pos] = to;
        self.log.push(LedgerEntry::StatusChanged {
            bid_id: self.submissions[pos].bid_id,
            from,
            to,
            at,
        });
    }

    fn bid_at(&self, pos: usize) -> Bid {
        Bid {
            status: self.statuses[pos],
            ..self.submissions[pos].clone()
        }
    }

    pub fn get(&self, bid_id: BidId) -> Option<Bid> {
        self.index.get(&bid_id).map(|&pos| self.bid_at(pos))
    }

    /// Bids in submission order with their current status. Lazy; call again to restart.
    pub fn iter(&self) -> impl Iterator<Item = Bid> + '_ {
        (0..self.submissions.len()).map(move |pos| self.bid_at(pos))
    }

    pub fn bids(&self) -> Vec<Bid> {
        self.iter().collect()
    }

    pub fn log(&self) -> &[LedgerEntry] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }

    pub fn accepted_bid(&self) -> Option<Bid> {
        self.accepted.and_then(|id| self.get(id))
    }

    /// Number of bids whose status is `accepted`, counted from the status column.
    pub fn accepted_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == BidStatus::Accepted)
            .count()
    }

    /// Amount of the rider's latest ask.
    pub fn current_ask(&self) -> Option<Decimal> {
        self.current_ask.map(|pos| self.submissions[pos].amount)
    }

    pub fn bounds(&self) -> Option<BidBounds> {
        let ask = self.current_ask()?;
        let (min, max) = counter_window(ask, self.rules.min_counter_ratio);
        Some(BidBounds {
            ask,
            min,
            max,
            suggested: suggested_counter(ask, self.rules.min_counter_ratio),
        })
    }
}
