//! Dispatch coordinator: the facade collaborators call.
//!
//! Each live ride request sits in its own `Mutex<RideSlot>`; every mutation of a ride
//! (bids, accept, transitions, cancellation, timer expiry) runs inside that slot's lock, so
//! operations on unrelated rides never contend. The ride map lock is held only for lookup,
//! insert and removal, never while waiting on a slot.
//!
//! Lock order: slot, then ride map / archive.
//!
//! Terminal rides move to the archive with their full bid ledger log.

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink, StdoutAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::DispatchError;
use crate::events::{EventStream, RideEvent, RideEventKind};
use crate::geo::{DriverPosition, GeoIndex, NearbyDriver};
use crate::ledger::{Bid, BidLedger, BidRules, LedgerEntry};
use crate::ride::{RideRequest, Transition};
use crate::types::{
    BidBounds, BidId, CancelReason, Coordinate, LocationPing, RideRequestId, RideState, Role,
    Timestamp, UserId,
};

/// Archived ride with its bid history and append-only ledger log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RideRecord {
    pub ride: RideRequest,
    pub bids: Vec<Bid>,
    pub ledger_log: Vec<LedgerEntry>,
}

/// Result of [`DispatchCoordinator::create_ride_request`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct RideCreated {
    pub ride_request_id: RideRequestId,
    pub state: RideState,
    /// The rider's opening ask, absent when the request was cancelled for lack of drivers.
    pub ask_bid_id: Option<BidId>,
    pub nearby_drivers: Vec<NearbyDriver>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Earnings {
    pub driver_id: UserId,
    pub completed_rides: usize,
    pub total: Decimal,
}

#[derive(Debug)]
struct GraceTimer {
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct RideSlot {
    ride: RideRequest,
    ledger: BidLedger,
    events: broadcast::Sender<RideEvent>,
    grace: Option<GraceTimer>,
}

impl RideSlot {
    fn publish(&self, kind: RideEventKind, timestamp: Timestamp) {
        // No receivers is fine.
        let _ = self.events.send(RideEvent {
            ride_request_id: self.ride.ride_request_id,
            kind,
            timestamp,
        });
    }

    fn publish_transition(&self, t: Transition) {
        self.publish(
            RideEventKind::StateChanged {
                from: t.from,
                to: t.to,
            },
            t.at,
        );
    }

    fn record(&self) -> RideRecord {
        RideRecord {
            ride: self.ride.clone(),
            bids: self.ledger.bids(),
            ledger_log: self.ledger.log().to_vec(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: EngineConfig,
    rules: BidRules,
    geo: GeoIndex,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    runtime: Handle,
    rides: RwLock<HashMap<RideRequestId, Arc<Mutex<RideSlot>>>>,
    archive: RwLock<BTreeMap<RideRequestId, RideRecord>>,
    next_ride_id: AtomicU64,
    next_bid_id: AtomicU64,
}

/// Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct DispatchCoordinator {
    inner: Arc<Inner>,
}

impl DispatchCoordinator {
    /// System clock, stdout audit trail, grace timers on the current tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|e| {
            DispatchError::InvariantViolation(format!("no tokio runtime for grace timers: {}", e))
        })?;
        Self::with_parts(
            config,
            Arc::new(SystemClock),
            Arc::new(StdoutAuditSink),
            runtime,
        )
    }

    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        runtime: Handle,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let geo = GeoIndex::new(
            config.h3_resolution,
            config.position_staleness,
            config.max_search_radius_m,
            clock.clone(),
        )?;
        let rules = BidRules {
            min_counter_ratio: config.min_counter_ratio,
            min_ask: config.min_ask,
            max_ask: config.max_ask,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                rules,
                geo,
                clock,
                audit,
                runtime,
                rides: RwLock::new(HashMap::new()),
                archive: RwLock::new(BTreeMap::new()),
                next_ride_id: AtomicU64::new(1),
                next_bid_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn geo(&self) -> &GeoIndex {
        &self.inner.geo
    }

    fn now(&self) -> Timestamp {
        self.inner.clock.now_millis()
    }

    // ---- ride lifecycle ----

    /// Validates the request, looks for nearby drivers and either opens bidding with the
    /// rider's ask as the first bid or cancels the request with `NoDrivers`.
    pub fn create_ride_request(
        &self,
        rider_id: UserId,
        pickup: Coordinate,
        destination: Coordinate,
        ask_amount: Decimal,
    ) -> Result<RideCreated, DispatchError> {
        let result = self.create_inner(rider_id, pickup, destination, ask_amount);
        let resource = result
            .as_ref()
            .ok()
            .map(|c| serde_json::json!({ "ride_id": c.ride_request_id.0, "state": c.state }));
        self.audit(rider_id.to_string(), AuditAction::RideCreate, resource, &result);
        result
    }

    fn create_inner(
        &self,
        rider_id: UserId,
        pickup: Coordinate,
        destination: Coordinate,
        ask_amount: Decimal,
    ) -> Result<RideCreated, DispatchError> {
        pickup.validate()?;
        destination.validate()?;
        let id = RideRequestId(self.inner.next_ride_id.fetch_add(1, Ordering::SeqCst));
        let mut ledger = BidLedger::new(id, self.inner.rules);
        ledger.validate_amount(Role::Rider, ask_amount)?;

        let now = self.now();
        let mut ride = RideRequest::new(id, rider_id, pickup, destination, now);
        info!(
            "ride created ride_id={} rider_id={} ask={} pickup={},{}",
            id, rider_id, ask_amount, pickup.lat, pickup.lng
        );
        let nearby = self.inner.geo.query_nearby(
            pickup,
            self.inner.config.search_radius_m,
            self.inner.config.nearby_limit,
        )?;

        if nearby.is_empty() {
            let t = ride.cancel(CancelReason::NoDrivers, now)?;
            info!("ride state ride_id={} from={} to={} reason=NoDrivers", id, t.from, t.to);
            let record = RideRecord {
                ride,
                bids: Vec::new(),
                ledger_log: Vec::new(),
            };
            self.inner.archive.write().insert(id, record);
            return Ok(RideCreated {
                ride_request_id: id,
                state: RideState::Cancelled,
                ask_bid_id: None,
                nearby_drivers: nearby,
            });
        }

        let t = ride.open_bidding(now)?;
        info!(
            "ride state ride_id={} from={} to={} drivers={}",
            id,
            t.from,
            t.to,
            nearby.len()
        );
        let bid_id = self.next_bid_id();
        let ask = ledger.submit_bid(&ride, bid_id, rider_id, Role::Rider, ask_amount, now)?;
        let (events, _) = broadcast::channel(self.inner.config.event_buffer);
        let slot = RideSlot {
            ride,
            ledger,
            events,
            grace: None,
        };
        self.inner
            .rides
            .write()
            .insert(id, Arc::new(Mutex::new(slot)));
        Ok(RideCreated {
            ride_request_id: id,
            state: RideState::Bidding,
            ask_bid_id: Some(ask.bid_id),
            nearby_drivers: nearby,
        })
    }

    /// Appends a pending bid and notifies subscribers. Driver bids need an online driver
    /// with a fresh position.
    pub fn submit_bid(
        &self,
        ride_request_id: RideRequestId,
        bidder_id: UserId,
        role: Role,
        amount: Decimal,
    ) -> Result<Bid, DispatchError> {
        let result = self.live_slot(ride_request_id, None).and_then(|slot| {
            let mut guard = slot.lock();
            let s = &mut *guard;
            if s.ride.state.is_terminal() {
                return Err(terminal_error(&s.ride, None));
            }
            if role == Role::Driver && s.ride.state == RideState::Bidding {
                self.ensure_driver(bidder_id)?;
            }
            let now = self.now();
            let bid_id = self.next_bid_id();
            let bid = s
                .ledger
                .submit_bid(&s.ride, bid_id, bidder_id, role, amount, now)?;
            s.publish(RideEventKind::BidSubmitted(bid.clone()), bid.submitted_at);
            Ok(bid)
        });
        let resource = serde_json::json!({
            "ride_id": ride_request_id.0,
            "bid_id": result.as_ref().ok().map(|b| b.bid_id.0),
            "amount": amount.to_string(),
        });
        self.audit(bidder_id.to_string(), AuditAction::BidSubmit, Some(resource), &result);
        result
    }

    /// Accepts a bid on behalf of the counterparty and moves the ride to `matched`.
    ///
    /// Exactly one of any number of concurrent accepts on a ride succeeds; the rest get
    /// `AlreadyResolved`. Taking the rider's ask requires an online driver with a fresh
    /// position. Starts the driver grace timer.
    pub fn accept_bid(
        &self,
        ride_request_id: RideRequestId,
        bid_id: BidId,
        actor_id: UserId,
    ) -> Result<RideRequest, DispatchError> {
        let result = self
            .live_slot(ride_request_id, Some(RideState::Matched))
            .and_then(|slot| {
                let mut guard = slot.lock();
                self.accept_locked(&mut guard, bid_id, actor_id)
            });
        let resource = serde_json::json!({ "ride_id": ride_request_id.0, "bid_id": bid_id.0 });
        self.audit(actor_id.to_string(), AuditAction::BidAccept, Some(resource), &result);
        result
    }

    fn accept_locked(
        &self,
        s: &mut RideSlot,
        bid_id: BidId,
        actor_id: UserId,
    ) -> Result<RideRequest, DispatchError> {
        if s.ride.state.is_terminal() {
            return Err(terminal_error(&s.ride, Some(RideState::Matched)));
        }
        let takes_ask = s.ride.state == RideState::Bidding
            && s.ride.accepted_bid_id.is_none()
            && s.ledger.get(bid_id).is_some_and(|b| b.role == Role::Rider);
        if takes_ask {
            self.ensure_driver(actor_id)?;
        }
        let now = self.now();
        // On error neither the ledger nor the ride has changed.
        let bid = s.ledger.accept_bid(&s.ride, bid_id, actor_id, now)?;
        let driver_id = match bid.role {
            Role::Driver => bid.bidder_id,
            Role::Rider => actor_id,
        };
        let t = s.ride.mark_matched(bid_id, driver_id, now)?;
        info!(
            "ride state ride_id={} from={} to={} bid_id={} driver_id={} amount={}",
            s.ride.ride_request_id, t.from, t.to, bid_id, driver_id, bid.amount
        );
        s.publish(
            RideEventKind::BidAccepted {
                bid_id,
                driver_id,
                amount: bid.amount,
            },
            now,
        );
        s.publish_transition(t);
        self.arm_grace(s);
        Ok(s.ride.clone())
    }

    fn arm_grace(&self, s: &mut RideSlot) {
        let deadline = Instant::now() + self.inner.config.match_grace;
        let ride_request_id = s.ride.ride_request_id;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                DispatchCoordinator { inner }.expire_grace(ride_request_id, deadline);
            }
        });
        if let Some(old) = s.grace.replace(GraceTimer { deadline, handle }) {
            old.handle.abort();
        }
    }

    /// Grace timer callback. Cancels the ride if it is still waiting for its driver.
    fn expire_grace(&self, ride_request_id: RideRequestId, deadline: Instant) {
        let Some(slot) = self.inner.rides.read().get(&ride_request_id).cloned() else {
            return;
        };
        let mut guard = slot.lock();
        let s = &mut *guard;
        let armed = s.grace.as_ref().map(|g| g.deadline) == Some(deadline);
        if s.ride.state != RideState::Matched || !armed {
            return;
        }
        s.grace = None;
        warn!(
            "driver timeout ride_id={} driver_id={:?}",
            ride_request_id, s.ride.driver_id
        );
        let result = self.cancel_locked(s, CancelReason::DriverTimeout);
        let resource = serde_json::json!({ "ride_id": ride_request_id.0, "reason": "DriverTimeout" });
        self.audit("system", AuditAction::RideCancel, Some(resource), &result);
    }

    /// Driver "arrived / start" signal. After the grace deadline the ride is cancelled
    /// with `DriverTimeout` and the call fails with the same error.
    pub fn start_ride(
        &self,
        ride_request_id: RideRequestId,
        driver_id: UserId,
    ) -> Result<RideRequest, DispatchError> {
        let result = self
            .live_slot(ride_request_id, Some(RideState::InProgress))
            .and_then(|slot| {
                let mut guard = slot.lock();
                let s = &mut *guard;
                if s.ride.state.is_terminal() {
                    return Err(terminal_error(&s.ride, Some(RideState::InProgress)));
                }
                s.ride.ensure_transition(RideState::InProgress)?;
                let expired = s
                    .grace
                    .as_ref()
                    .is_some_and(|g| Instant::now() >= g.deadline);
                if expired {
                    warn!("driver timeout ride_id={} on start", ride_request_id);
                    self.cancel_locked(s, CancelReason::DriverTimeout)?;
                    return Err(DispatchError::DriverTimeout(ride_request_id));
                }
                let t = s.ride.start(driver_id, self.now())?;
                if let Some(g) = s.grace.take() {
                    g.handle.abort();
                }
                info!("ride state ride_id={} from={} to={}", ride_request_id, t.from, t.to);
                s.publish_transition(t);
                Ok(s.ride.clone())
            });
        let resource = serde_json::json!({ "ride_id": ride_request_id.0 });
        self.audit(driver_id.to_string(), AuditAction::RideStart, Some(resource), &result);
        result
    }

    /// "Ride ended" signal. Settles at the accepted bid's amount and archives the ride.
    pub fn complete_ride(
        &self,
        ride_request_id: RideRequestId,
        driver_id: UserId,
    ) -> Result<RideRequest, DispatchError> {
        let result = self
            .live_slot(ride_request_id, Some(RideState::Completed))
            .and_then(|slot| {
                let mut guard = slot.lock();
                let s = &mut *guard;
                if s.ride.state.is_terminal() {
                    return Err(terminal_error(&s.ride, Some(RideState::Completed)));
                }
                s.ride.ensure_transition(RideState::Completed)?;
                let settled = s.ledger.accepted_bid().map(|b| b.amount).ok_or_else(|| {
                    error!("in-progress ride without accepted bid ride_id={}", ride_request_id);
                    DispatchError::InvariantViolation(format!(
                        "ride {} in progress without an accepted bid",
                        ride_request_id
                    ))
                })?;
                let t = s.ride.complete(driver_id, settled, self.now())?;
                info!(
                    "ride state ride_id={} from={} to={} settled={}",
                    ride_request_id, t.from, t.to, settled
                );
                s.publish_transition(t);
                self.archive_slot(s);
                Ok(s.ride.clone())
            });
        let resource = serde_json::json!({
            "ride_id": ride_request_id.0,
            "settled": result.as_ref().ok().and_then(|r| r.settled_amount).map(|a| a.to_string()),
        });
        self.audit(driver_id.to_string(), AuditAction::RideComplete, Some(resource), &result);
        result
    }

    /// Cancels a ride before `in_progress`.
    ///
    /// `RiderCancelled` must come from the ride's rider. `NoDrivers` and `DriverTimeout` are
    /// issued by the engine itself and are refused here.
    pub fn cancel(
        &self,
        ride_request_id: RideRequestId,
        actor_id: UserId,
        reason: CancelReason,
    ) -> Result<RideRequest, DispatchError> {
        let result = if reason.is_system_issued() {
            Err(DispatchError::Unauthorized(format!(
                "{:?} is issued by the dispatcher only",
                reason
            )))
        } else {
            self.live_slot(ride_request_id, Some(RideState::Cancelled))
                .and_then(|slot| {
                    let mut guard = slot.lock();
                    let s = &mut *guard;
                    if s.ride.state.is_terminal() {
                        return Err(terminal_error(&s.ride, Some(RideState::Cancelled)));
                    }
                    if reason == CancelReason::RiderCancelled && actor_id != s.ride.rider_id {
                        return Err(DispatchError::Unauthorized(format!(
                            "user {} is not the rider of ride {}",
                            actor_id, ride_request_id
                        )));
                    }
                    self.cancel_locked(s, reason)?;
                    Ok(s.ride.clone())
                })
        };
        let resource = serde_json::json!({ "ride_id": ride_request_id.0, "reason": format!("{:?}", reason) });
        self.audit(actor_id.to_string(), AuditAction::RideCancel, Some(resource), &result);
        result
    }

    fn cancel_locked(&self, s: &mut RideSlot, reason: CancelReason) -> Result<(), DispatchError> {
        let now = self.now();
        let t = s.ride.cancel(reason, now)?;
        let rejected = s.ledger.reject_pending(now);
        if let Some(g) = s.grace.take() {
            g.handle.abort();
        }
        let had_accepted_bid = s.ride.accepted_bid_id.is_some();
        info!(
            "ride state ride_id={} from={} to={} reason={:?} had_accepted_bid={} rejected_bids={}",
            s.ride.ride_request_id, t.from, t.to, reason, had_accepted_bid, rejected
        );
        s.publish_transition(t);
        s.publish(
            RideEventKind::Cancelled {
                reason,
                had_accepted_bid,
            },
            now,
        );
        self.archive_slot(s);
        Ok(())
    }

    fn archive_slot(&self, s: &RideSlot) {
        let id = s.ride.ride_request_id;
        self.inner.archive.write().insert(id, s.record());
        self.inner.rides.write().remove(&id);
    }

    /// Lifecycle and bid events for a ride until it reaches a terminal state.
    /// For a ride already archived the stream is empty.
    pub fn subscribe(&self, ride_request_id: RideRequestId) -> Result<EventStream, DispatchError> {
        match self.live_slot(ride_request_id, None) {
            Ok(slot) => {
                let s = slot.lock();
                if s.ride.state.is_terminal() {
                    Ok(EventStream::finished())
                } else {
                    Ok(EventStream::live(s.events.subscribe()))
                }
            }
            Err(DispatchError::RideClosed(_)) => Ok(EventStream::finished()),
            Err(e) => Err(e),
        }
    }

    // ---- queries ----

    pub fn get_ride(&self, ride_request_id: RideRequestId) -> Result<RideRequest, DispatchError> {
        let live = self.inner.rides.read().get(&ride_request_id).cloned();
        if let Some(slot) = live {
            return Ok(slot.lock().ride.clone());
        }
        self.archived(ride_request_id).map(|r| r.ride)
    }

    /// Bids in submission order, each with its current status.
    pub fn list_bids(&self, ride_request_id: RideRequestId) -> Result<Vec<Bid>, DispatchError> {
        let live = self.inner.rides.read().get(&ride_request_id).cloned();
        if let Some(slot) = live {
            return Ok(slot.lock().ledger.bids());
        }
        self.archived(ride_request_id).map(|r| r.bids)
    }

    /// Permitted counter-bid window and suggested counter for a ride in bidding.
    pub fn bid_bounds(&self, ride_request_id: RideRequestId) -> Result<BidBounds, DispatchError> {
        let slot = self.live_slot(ride_request_id, None)?;
        let s = slot.lock();
        if s.ride.state != RideState::Bidding {
            return Err(DispatchError::RideClosed(ride_request_id));
        }
        s.ledger.bounds().ok_or_else(|| {
            DispatchError::InvariantViolation(format!("ride {} bidding without an ask", ride_request_id))
        })
    }

    /// Drivers currently near the ride's pickup point.
    pub fn nearby_drivers(
        &self,
        ride_request_id: RideRequestId,
    ) -> Result<Vec<NearbyDriver>, DispatchError> {
        let pickup = self.get_ride(ride_request_id)?.pickup;
        self.query_nearby(pickup, self.inner.config.search_radius_m, self.inner.config.nearby_limit)
    }

    pub fn query_nearby(
        &self,
        point: Coordinate,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>, DispatchError> {
        self.inner.geo.query_nearby(point, radius_m, limit)
    }

    pub fn live_rides(&self) -> usize {
        self.inner.rides.read().len()
    }

    // ---- driver positions ----

    pub fn upsert_position(
        &self,
        driver_id: UserId,
        coordinate: Coordinate,
        timestamp: Timestamp,
    ) -> Result<DriverPosition, DispatchError> {
        self.inner.geo.upsert_position(driver_id, coordinate, timestamp)
    }

    pub fn apply_ping(&self, ping: &LocationPing) -> Result<DriverPosition, DispatchError> {
        self.inner.geo.apply_ping(ping)
    }

    /// Online/offline toggle. Leaves the last location and its timestamp as reported.
    pub fn set_availability(
        &self,
        driver_id: UserId,
        available: bool,
    ) -> Result<DriverPosition, DispatchError> {
        info!("driver availability driver_id={} available={}", driver_id, available);
        self.inner.geo.set_availability(driver_id, available)
    }

    // ---- history ----

    pub fn history_for_rider(&self, rider_id: UserId) -> Vec<RideRecord> {
        self.inner
            .archive
            .read()
            .values()
            .filter(|r| r.ride.rider_id == rider_id)
            .cloned()
            .collect()
    }

    pub fn history_for_driver(&self, driver_id: UserId) -> Vec<RideRecord> {
        self.inner
            .archive
            .read()
            .values()
            .filter(|r| r.ride.driver_id == Some(driver_id))
            .cloned()
            .collect()
    }

    /// Sum of settled fares over the driver's completed rides.
    pub fn earnings_for_driver(&self, driver_id: UserId) -> Result<Earnings, DispatchError> {
        let archive = self.inner.archive.read();
        let settled: Vec<Decimal> = archive
            .values()
            .filter(|r| r.ride.driver_id == Some(driver_id) && r.ride.state == RideState::Completed)
            .filter_map(|r| r.ride.settled_amount)
            .collect();
        let total = settled
            .iter()
            .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(*amount))
            .ok_or_else(|| {
                DispatchError::InvalidAmount(format!("earnings of driver {} overflow", driver_id))
            })?;
        Ok(Earnings {
            driver_id,
            completed_rides: settled.len(),
            total,
        })
    }

    pub fn archive_snapshot(&self) -> Vec<RideRecord> {
        self.inner.archive.read().values().cloned().collect()
    }

    /// Loads archived rides (e.g. from disk) and moves id counters past them.
    pub fn restore_archive(&self, records: Vec<RideRecord>) -> usize {
        let mut archive = self.inner.archive.write();
        let mut restored = 0;
        for record in records {
            self.reserve_ids(&record);
            archive.insert(record.ride.ride_request_id, record);
            restored += 1;
        }
        info!("archive restored rides={}", restored);
        restored
    }

    /// Rides still in flight, each with its bids and full ledger log, ordered by id.
    pub fn live_snapshot(&self) -> Vec<RideRecord> {
        let slots: Vec<_> = self.inner.rides.read().values().cloned().collect();
        let mut records: Vec<RideRecord> = slots.iter().map(|slot| slot.lock().record()).collect();
        records.sort_by_key(|r| r.ride.ride_request_id);
        records
    }

    /// Puts persisted in-flight rides back into play. Each ledger is rebuilt from its log;
    /// a matched ride gets a fresh grace period for its driver.
    pub fn restore_live(&self, records: Vec<RideRecord>) -> Result<usize, DispatchError> {
        let mut restored = 0;
        for record in records {
            let id = record.ride.ride_request_id;
            if record.ride.state.is_terminal() || record.ride.state == RideState::Open {
                return Err(DispatchError::InvariantViolation(format!(
                    "ride {} cannot be restored in state {}",
                    id, record.ride.state
                )));
            }
            let ledger = BidLedger::replay(id, self.inner.rules, &record.ledger_log)?;
            if ledger.accepted_bid().map(|b| b.bid_id) != record.ride.accepted_bid_id {
                return Err(DispatchError::InvariantViolation(format!(
                    "ride {} and its ledger disagree on the accepted bid",
                    id
                )));
            }
            self.reserve_ids(&record);
            let (events, _) = broadcast::channel(self.inner.config.event_buffer);
            let mut slot = RideSlot {
                ride: record.ride,
                ledger,
                events,
                grace: None,
            };
            if slot.ride.state == RideState::Matched {
                self.arm_grace(&mut slot);
            }
            self.inner
                .rides
                .write()
                .insert(id, Arc::new(Mutex::new(slot)));
            restored += 1;
        }
        info!("live rides restored rides={}", restored);
        Ok(restored)
    }

    // ---- helpers ----

    /// A driver may bid or take an ask only while online with a fresh position.
    fn ensure_driver(&self, driver_id: UserId) -> Result<(), DispatchError> {
        let position = self.inner.geo.position(driver_id).ok_or_else(|| {
            DispatchError::Unauthorized(format!("user {} is not a registered driver", driver_id))
        })?;
        if !position.available {
            return Err(DispatchError::Unauthorized(format!("driver {} is offline", driver_id)));
        }
        if self.inner.geo.is_stale(&position, self.now()) {
            return Err(DispatchError::Unauthorized(format!(
                "driver {} has no recent position",
                driver_id
            )));
        }
        Ok(())
    }

    fn reserve_ids(&self, record: &RideRecord) {
        let id = record.ride.ride_request_id;
        self.inner.next_ride_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        if let Some(max_bid) = record.bids.iter().map(|b| b.bid_id.0).max() {
            self.inner.next_bid_id.fetch_max(max_bid + 1, Ordering::SeqCst);
        }
    }

    fn next_bid_id(&self) -> BidId {
        BidId(self.inner.next_bid_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Slot of a live ride. Archived rides yield the error the attempted operation
    /// (`intent`, or bid submission when `None`) would get on a terminal ride.
    fn live_slot(
        &self,
        ride_request_id: RideRequestId,
        intent: Option<RideState>,
    ) -> Result<Arc<Mutex<RideSlot>>, DispatchError> {
        let live = self.inner.rides.read().get(&ride_request_id).cloned();
        if let Some(slot) = live {
            return Ok(slot);
        }
        let record = self.archived(ride_request_id)?;
        Err(terminal_error(&record.ride, intent))
    }

    fn archived(&self, ride_request_id: RideRequestId) -> Result<RideRecord, DispatchError> {
        self.inner
            .archive
            .read()
            .get(&ride_request_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("ride {}", ride_request_id)))
    }

    fn audit<T>(
        &self,
        actor: impl Into<String>,
        action: AuditAction,
        resource: Option<serde_json::Value>,
        result: &Result<T, DispatchError>,
    ) {
        let event = AuditEvent::new(
            self.now(),
            actor,
            action,
            resource,
            AuditOutcome::from_result(result),
        );
        self.inner.audit.emit(&event);
    }
}

/// Error for an operation attempted on a ride that already reached a terminal state.
fn terminal_error(ride: &RideRequest, intent: Option<RideState>) -> DispatchError {
    match intent {
        None => DispatchError::RideClosed(ride.ride_request_id),
        Some(RideState::Matched) if ride.accepted_bid_id.is_some() => {
            DispatchError::AlreadyResolved(ride.ride_request_id)
        }
        Some(RideState::InProgress)
            if ride.cancellation.map(|c| c.reason) == Some(CancelReason::DriverTimeout) =>
        {
            DispatchError::DriverTimeout(ride.ride_request_id)
        }
        Some(RideState::Matched | RideState::InProgress)
            if ride.cancellation.map(|c| c.reason) == Some(CancelReason::NoDrivers) =>
        {
            DispatchError::NoDrivers
        }
        Some(to) => DispatchError::InvalidTransition {
            from: ride.state,
            to,
        },
    }
}
