//! Accept races: many concurrent accepts on one ride, and independent rides in parallel.

use ride_auction_engine::{
    BidStatus, Coordinate, DispatchCoordinator, DispatchError, EngineConfig, RideState, Role, UserId,
};
use rust_decimal::Decimal;
use std::sync::{Arc, Barrier};

const RIDER: UserId = UserId(1);

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn pickup() -> Coordinate {
    Coordinate::new(37.77, -122.41)
}

fn dispatcher_with_drivers(drivers: impl IntoIterator<Item = u64>) -> DispatchCoordinator {
    init_log();
    let d = DispatchCoordinator::new(EngineConfig::default()).unwrap();
    for driver in drivers {
        d.upsert_position(UserId(driver), pickup(), now_ms()).unwrap();
    }
    d
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hundred_concurrent_accepts_yield_one_success() {
    let d = dispatcher_with_drivers(1_000..1_100);
    let ride_id = d
        .create_ride_request(RIDER, pickup(), Coordinate::new(37.8, -122.27), Decimal::new(2000, 2))
        .unwrap()
        .ride_request_id;
    let bids: Vec<_> = (0..100u64)
        .map(|i| {
            d.submit_bid(ride_id, UserId(1_000 + i), Role::Driver, Decimal::new(1500, 2))
                .unwrap()
                .bid_id
        })
        .collect();

    let barrier = Arc::new(Barrier::new(bids.len()));
    let handles: Vec<_> = bids
        .into_iter()
        .map(|bid_id| {
            let d = d.clone();
            let barrier = barrier.clone();
            tokio::task::spawn_blocking(move || {
                barrier.wait();
                d.accept_bid(ride_id, bid_id, RIDER)
            })
        })
        .collect();

    let mut ok = 0;
    let mut already_resolved = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(ride) => {
                assert_eq!(ride.state, RideState::Matched);
                ok += 1;
            }
            Err(DispatchError::AlreadyResolved(id)) => {
                assert_eq!(id, ride_id);
                already_resolved += 1;
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already_resolved, 99);

    let bids = d.list_bids(ride_id).unwrap();
    assert_eq!(bids.iter().filter(|b| b.status == BidStatus::Accepted).count(), 1);
    assert!(bids.iter().all(|b| b.status != BidStatus::Pending));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rider_accept_and_driver_take_race() {
    let d = dispatcher_with_drivers([200, 300]);
    for _ in 0..50 {
        let created = d
            .create_ride_request(RIDER, pickup(), Coordinate::new(37.8, -122.27), Decimal::new(2000, 2))
            .unwrap();
        let ride_id = created.ride_request_id;
        let ask = created.ask_bid_id.unwrap();
        let counter = d
            .submit_bid(ride_id, UserId(200), Role::Driver, Decimal::new(1800, 2))
            .unwrap()
            .bid_id;

        let barrier = Arc::new(Barrier::new(2));
        let (d1, b1) = (d.clone(), barrier.clone());
        let rider = tokio::task::spawn_blocking(move || {
            b1.wait();
            d1.accept_bid(ride_id, counter, RIDER)
        });
        let (d2, b2) = (d.clone(), barrier);
        let driver = tokio::task::spawn_blocking(move || {
            b2.wait();
            d2.accept_bid(ride_id, ask, UserId(300))
        });
        let results = [rider.await.unwrap(), driver.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(DispatchError::AlreadyResolved(_)))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_rides_progress_in_parallel() {
    let d = dispatcher_with_drivers(20_000..20_032);
    let handles: Vec<_> = (0..32u64)
        .map(|i| {
            let d = d.clone();
            tokio::task::spawn_blocking(move || {
                let rider = UserId(10_000 + i);
                let driver = UserId(20_000 + i);
                let ride_id = d
                    .create_ride_request(rider, pickup(), Coordinate::new(37.8, -122.27), Decimal::new(3000, 2))
                    .unwrap()
                    .ride_request_id;
                let bid = d
                    .submit_bid(ride_id, driver, Role::Driver, Decimal::new(2500, 2))
                    .unwrap();
                d.accept_bid(ride_id, bid.bid_id, rider).unwrap();
                d.start_ride(ride_id, driver).unwrap();
                d.complete_ride(ride_id, driver).unwrap()
            })
        })
        .collect();
    for h in handles {
        let ride = h.await.unwrap();
        assert_eq!(ride.state, RideState::Completed);
        assert_eq!(ride.settled_amount, Some(Decimal::new(2500, 2)));
    }
    assert_eq!(d.live_rides(), 0);
    assert_eq!(d.archive_snapshot().len(), 32);
}
