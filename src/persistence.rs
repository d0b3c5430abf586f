//! Persistence: save and load rides to a JSON file.
//!
//! Archived and in-flight rides both carry their bid list and the append-only ledger log,
//! so a reload restores the full audit history and puts unfinished auctions back into play.

use std::path::Path;

use crate::dispatch::{DispatchCoordinator, RideRecord};
use crate::types::Timestamp;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PersistedState {
    /// Terminal rides.
    pub rides: Vec<RideRecord>,
    /// Rides still bidding, matched or in progress when the state was captured.
    #[serde(default)]
    pub live: Vec<RideRecord>,
    pub saved_at: Timestamp,
}

impl PersistedState {
    pub fn capture(dispatcher: &DispatchCoordinator, saved_at: Timestamp) -> Self {
        Self {
            rides: dispatcher.archive_snapshot(),
            live: dispatcher.live_snapshot(),
            saved_at,
        }
    }

    /// Loads the archive and resumes in-flight rides. Returns `(archived, live)` counts.
    pub fn restore_into(self, dispatcher: &DispatchCoordinator) -> Result<(usize, usize), String> {
        let archived = dispatcher.restore_archive(self.rides);
        let live = dispatcher
            .restore_live(self.live)
            .map_err(|e| e.to_string())?;
        Ok((archived, live))
    }
}

/// One JSON file. Save on shutdown; load on startup.
#[derive(Clone, Debug)]
pub struct FilePersistence {
    path: std::path::PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Overwrites the file.
    pub fn save(&self, state: &PersistedState) -> Result<(), String> {
        let json = serde_json::to_string_pretty(state).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, json).map_err(|e| e.to_string())
    }

    /// `Ok(None)` if the file does not exist.
    pub fn load(&self) -> Result<Option<PersistedState>, String> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        let state: PersistedState = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Bid, LedgerEntry};
    use crate::ride::RideRequest;
    use crate::types::{
        BidId, BidStatus, CancelReason, Coordinate, RideRequestId, RideState, Role, UserId,
    };
    use rust_decimal::Decimal;

    fn record() -> RideRecord {
        let mut ride = RideRequest::new(
            RideRequestId(3),
            UserId(1),
            Coordinate::new(37.77, -122.41),
            Coordinate::new(37.80, -122.27),
            10,
        );
        ride.open_bidding(10).unwrap();
        ride.cancel(CancelReason::RiderCancelled, 20).unwrap();
        let bid = Bid {
            bid_id: BidId(9),
            ride_request_id: RideRequestId(3),
            bidder_id: UserId(1),
            role: Role::Rider,
            amount: Decimal::new(2000, 2),
            submitted_at: 10,
            status: BidStatus::Pending,
        };
        RideRecord {
            ride,
            bids: vec![Bid {
                status: BidStatus::Rejected,
                ..bid.clone()
            }],
            ledger_log: vec![
                LedgerEntry::Submitted { bid },
                LedgerEntry::StatusChanged {
                    bid_id: BidId(9),
                    from: BidStatus::Pending,
                    to: BidStatus::Rejected,
                    at: 20,
                },
            ],
        }
    }

    #[test]
    fn save_then_load_preserves_ledger_log() {
        let path = std::env::temp_dir().join(format!("ride_archive_{}.json", std::process::id()));
        let persistence = FilePersistence::new(&path);
        let state = PersistedState {
            rides: vec![record()],
            live: Vec::new(),
            saved_at: 99,
        };
        persistence.save(&state).unwrap();
        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.rides[0].ledger_log.len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bidding_ride_survives_save_and_load() {
        use crate::audit::InMemoryAuditSink;
        use crate::clock::ManualClock;
        use crate::config::EngineConfig;
        use std::sync::Arc;

        let clock = ManualClock::new(1_000);
        let dispatcher = || {
            DispatchCoordinator::with_parts(
                EngineConfig::default(),
                Arc::new(clock.clone()),
                Arc::new(InMemoryAuditSink::new()),
                tokio::runtime::Handle::current(),
            )
            .unwrap()
        };
        let pickup = Coordinate::new(37.77, -122.41);
        let destination = Coordinate::new(37.80, -122.27);

        let before = dispatcher();
        before.upsert_position(UserId(100), pickup, 1_000).unwrap();
        before.upsert_position(UserId(101), pickup, 1_000).unwrap();
        let ride_id = before
            .create_ride_request(UserId(1), pickup, destination, Decimal::new(2000, 2))
            .unwrap()
            .ride_request_id;
        before
            .submit_bid(ride_id, UserId(100), Role::Driver, Decimal::new(1800, 2))
            .unwrap();
        let counter = before
            .submit_bid(ride_id, UserId(100), Role::Driver, Decimal::new(1700, 2))
            .unwrap();

        let path = std::env::temp_dir().join(format!("ride_live_{}.json", std::process::id()));
        let persistence = FilePersistence::new(&path);
        let state = PersistedState::capture(&before, 2_000);
        assert!(state.rides.is_empty());
        assert_eq!(state.live.len(), 1);
        // ask + two counters, plus the first counter superseded
        assert_eq!(state.live[0].ledger_log.len(), 4);
        persistence.save(&state).unwrap();
        let loaded = persistence.load().unwrap().unwrap();
        let _ = std::fs::remove_file(&path);

        let after = dispatcher();
        after.upsert_position(UserId(100), pickup, 1_000).unwrap();
        assert_eq!(loaded.clone().restore_into(&after).unwrap(), (0, 1));
        assert_eq!(after.live_snapshot(), state.live);
        assert_eq!(after.list_bids(ride_id).unwrap(), before.list_bids(ride_id).unwrap());

        let matched = after.accept_bid(ride_id, counter.bid_id, UserId(1)).unwrap();
        assert_eq!(matched.state, RideState::Matched);
        let next = after
            .submit_bid(ride_id, UserId(100), Role::Driver, Decimal::new(1600, 2))
            .unwrap_err();
        assert_eq!(next, crate::error::DispatchError::RideClosed(ride_id));
    }

    #[test]
    fn load_missing_file_is_none() {
        let persistence = FilePersistence::new("/nonexistent/ride_archive.json");
        assert!(persistence.load().unwrap().is_none());
    }
}
