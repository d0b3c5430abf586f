//! REST API integration tests. Spawn the server and call endpoints with reqwest.

use ride_auction_engine::{api, DispatchCoordinator, EngineConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;

async fn spawn_app() -> (SocketAddr, DispatchCoordinator, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = DispatchCoordinator::new(EngineConfig::default()).unwrap();
    let app = api::create_router(dispatcher.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    (addr, dispatcher, handle)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

async fn ping_driver(client: &reqwest::Client, addr: SocketAddr, driver_id: u64) {
    let ping = json!({
        "driver_id": driver_id,
        "lat": 37.771,
        "lng": -122.41,
        "timestamp": now_ms(),
        "available": true
    });
    let response = client
        .post(format!("http://{}/drivers/location", addr))
        .json(&ping)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

async fn create_ride(client: &reqwest::Client, addr: SocketAddr, ask: &str) -> Value {
    let body = json!({
        "rider_id": 1,
        "pickup": { "lat": 37.77, "lng": -122.41 },
        "destination": { "lat": 37.80, "lng": -122.27 },
        "ask_amount": ask
    });
    let response = client
        .post(format!("http://{}/rides", addr))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (addr, _d, _handle) = spawn_app().await;
    let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn create_ride_without_drivers_is_cancelled() {
    let (addr, _d, _handle) = spawn_app().await;
    let client = reqwest::Client::new();
    let created = create_ride(&client, addr, "20.00").await;
    assert_eq!(created["state"], "cancelled");

    let id = created["ride_request_id"].as_u64().unwrap();
    let ride: Value = client
        .get(format!("http://{}/rides/{}", addr, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ride["cancellation"]["reason"], "NoDrivers");
}

#[tokio::test]
async fn bid_accept_start_complete_flow() {
    let (addr, _d, _handle) = spawn_app().await;
    let client = reqwest::Client::new();
    ping_driver(&client, addr, 100).await;

    let created = create_ride(&client, addr, "20.00").await;
    assert_eq!(created["state"], "bidding");
    let id = created["ride_request_id"].as_u64().unwrap();

    let bounds: Value = client
        .get(format!("http://{}/rides/{}/bounds", addr, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bounds["min"], "10.00");
    assert_eq!(bounds["suggested"], "18.00");

    let response = client
        .post(format!("http://{}/rides/{}/bids", addr, id))
        .json(&json!({ "bidder_id": 100, "role": "driver", "amount": "18.00" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let bid: Value = response.json().await.unwrap();
    assert_eq!(bid["status"], "pending");

    let response = client
        .post(format!("http://{}/rides/{}/accept", addr, id))
        .json(&json!({ "bid_id": bid["bid_id"], "actor_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let ride: Value = response.json().await.unwrap();
    assert_eq!(ride["state"], "matched");

    let bids: Value = client
        .get(format!("http://{}/rides/{}/bids", addr, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let statuses: Vec<&str> = bids
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["superseded", "accepted"]);

    let started: Value = client
        .post(format!("http://{}/rides/{}/start", addr, id))
        .json(&json!({ "driver_id": 100 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(started["state"], "in_progress");

    let completed: Value = client
        .post(format!("http://{}/rides/{}/complete", addr, id))
        .json(&json!({ "driver_id": 100 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(completed["state"], "completed");
    assert_eq!(completed["settled_amount"], "18.00");

    let earnings: Value = client
        .get(format!("http://{}/drivers/100/earnings", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(earnings["completed_rides"], 1);
    assert_eq!(earnings["total"], "18.00");

    let history: Value = client
        .get(format!("http://{}/riders/1/history", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (addr, _d, _handle) = spawn_app().await;
    let client = reqwest::Client::new();
    ping_driver(&client, addr, 100).await;
    let id = create_ride(&client, addr, "20.00").await["ride_request_id"]
        .as_u64()
        .unwrap();

    // one cent below the 0.5x floor
    let response = client
        .post(format!("http://{}/rides/{}/bids", addr, id))
        .json(&json!({ "bidder_id": 100, "role": "driver", "amount": "9.99" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_amount");

    // never reported a position
    let response = client
        .post(format!("http://{}/rides/{}/bids", addr, id))
        .json(&json!({ "bidder_id": 555, "role": "driver", "amount": "15.00" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");

    let response = client
        .get(format!("http://{}/rides/9999", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("http://{}/rides/{}/cancel", addr, id))
        .json(&json!({ "actor_id": 100, "reason": "RiderCancelled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .post(format!("http://{}/rides/{}/cancel", addr, id))
        .json(&json!({ "actor_id": 1, "reason": "RiderCancelled" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("http://{}/rides/{}/bids", addr, id))
        .json(&json!({ "bidder_id": 100, "role": "driver", "amount": "15.00" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ride_closed");
}

#[tokio::test]
async fn nearby_and_availability() {
    let (addr, _d, _handle) = spawn_app().await;
    let client = reqwest::Client::new();
    ping_driver(&client, addr, 100).await;
    ping_driver(&client, addr, 101).await;

    let url = format!("http://{}/drivers/nearby?lat=37.77&lng=-122.41&radius_m=500", addr);
    let nearby: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    let ids: Vec<u64> = nearby
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["driver_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![100, 101]);

    let response = client
        .post(format!("http://{}/drivers/100/availability", addr))
        .json(&json!({ "available": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let nearby: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(nearby.as_array().unwrap().len(), 1);

    let response = client
        .get(format!("http://{}/drivers/nearby?lat=137.0&lng=0", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}
