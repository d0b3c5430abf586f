//! # Ride Auction Engine
//!
//! In-memory bid-matching and ride-lifecycle engine for a two-sided ride marketplace:
//! riders post an ask, nearby drivers counter-bid, and whichever side accepts fixes the fare.
//!
//! ## Entry point
//!
//! Use [`DispatchCoordinator`] as the single entry point: feed driver positions with
//! [`DispatchCoordinator::upsert_position`], then [`DispatchCoordinator::create_ride_request`],
//! [`DispatchCoordinator::submit_bid`], [`DispatchCoordinator::accept_bid`] and the lifecycle
//! signals. [`DispatchCoordinator::subscribe`] yields the per-ride event feed.
//!
//! ## Example
//!
//! ```rust
//! use ride_auction_engine::clock::{Clock, SystemClock};
//! use ride_auction_engine::{Coordinate, DispatchCoordinator, EngineConfig, RideState, Role, UserId};
//! use rust_decimal::Decimal;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = DispatchCoordinator::new(EngineConfig::default()).unwrap();
//! let pickup = Coordinate::new(37.77, -122.41);
//! dispatcher.upsert_position(UserId(100), pickup, SystemClock.now_millis()).unwrap();
//!
//! let ride = dispatcher
//!     .create_ride_request(UserId(1), pickup, Coordinate::new(37.80, -122.27), Decimal::new(2000, 2))
//!     .unwrap();
//! assert_eq!(ride.state, RideState::Bidding);
//!
//! let bid = dispatcher
//!     .submit_bid(ride.ride_request_id, UserId(100), Role::Driver, Decimal::new(1800, 2))
//!     .unwrap();
//! let matched = dispatcher.accept_bid(ride.ride_request_id, bid.bid_id, UserId(1)).unwrap();
//! assert_eq!(matched.state, RideState::Matched);
//! # }
//! ```
//!
//! ## Lower-level API
//!
//! [`GeoIndex`], [`BidLedger`] and [`RideRequest`] can be used directly if you do your own
//! per-ride serialization.

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fleet_gen;
pub mod geo;
pub mod ledger;
pub mod persistence;
pub mod ride;
pub mod types;

pub use config::EngineConfig;
pub use dispatch::{DispatchCoordinator, Earnings, RideCreated, RideRecord};
pub use error::DispatchError;
pub use events::{EventStream, RideEvent, RideEventKind};
pub use fleet_gen::{replay_into_dispatcher, FleetConfig, FleetGenerator};
pub use geo::{DriverPosition, GeoIndex, NearbyDriver};
pub use ledger::{Bid, BidLedger, BidRules, LedgerEntry};
pub use ride::{Cancellation, RideRequest, Transition};
pub use types::{
    BidBounds, BidId, BidStatus, CancelReason, Coordinate, LocationPing, RideRequestId, RideState,
    Role, Timestamp, UserId,
};
