//! REST API and WebSocket event feed for the dispatcher.
//!
//! Used by the binary and by integration tests. Create with [`create_router`].
//! Uses Extension for state so the router is `Router<()>` and works with `into_make_service()`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use log::debug;
use rust_decimal::Decimal;

use crate::dispatch::DispatchCoordinator;
use crate::error::DispatchError;
use crate::events::EventStream;
use crate::types::{BidId, CancelReason, Coordinate, LocationPing, RideRequestId, Role, UserId};

#[derive(Clone)]
pub struct AppState {
    pub(crate) dispatcher: DispatchCoordinator,
}

/// Builds the router around an existing dispatcher (so the caller keeps a handle for
/// persistence and shutdown).
pub fn create_router(dispatcher: DispatchCoordinator) -> Router<()> {
    let state = AppState { dispatcher };
    Router::new()
        .route("/health", get(health))
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/bids", get(list_bids).post(submit_bid))
        .route("/rides/:id/bounds", get(bid_bounds))
        .route("/rides/:id/nearby", get(ride_nearby))
        .route("/rides/:id/accept", post(accept_bid))
        .route("/rides/:id/start", post(start_ride))
        .route("/rides/:id/complete", post(complete_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/riders/:id/history", get(rider_history))
        .route("/drivers/location", post(driver_location))
        .route("/drivers/nearby", get(drivers_nearby))
        .route("/drivers/:id/availability", post(driver_availability))
        .route("/drivers/:id/earnings", get(driver_earnings))
        .route("/drivers/:id/history", get(driver_history))
        .route("/ws/rides/:id/events", get(ws_ride_events))
        .layer(Extension(state))
}

/// 400 by default; 404 / 403 / 409 / 500 where the error kind calls for it.
fn error_response(err: DispatchError) -> Response {
    let status = match &err {
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::Unauthorized(_) => StatusCode::FORBIDDEN,
        DispatchError::AlreadyResolved(_)
        | DispatchError::RideClosed(_)
        | DispatchError::InvalidTransition { .. }
        | DispatchError::NoDrivers => StatusCode::CONFLICT,
        DispatchError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string(), "code": err.code() })),
    )
        .into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, DispatchError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(serde::Deserialize)]
struct CreateRideRequest {
    rider_id: u64,
    pickup: Coordinate,
    destination: Coordinate,
    ask_amount: Decimal,
}

async fn create_ride(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateRideRequest>,
) -> Response {
    respond(state.dispatcher.create_ride_request(
        UserId(body.rider_id),
        body.pickup,
        body.destination,
        body.ask_amount,
    ))
}

async fn get_ride(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    respond(state.dispatcher.get_ride(RideRequestId(id)))
}

async fn list_bids(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    respond(state.dispatcher.list_bids(RideRequestId(id)))
}

async fn bid_bounds(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    respond(state.dispatcher.bid_bounds(RideRequestId(id)))
}

async fn ride_nearby(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    respond(state.dispatcher.nearby_drivers(RideRequestId(id)))
}

#[derive(serde::Deserialize)]
struct SubmitBidRequest {
    bidder_id: u64,
    role: Role,
    amount: Decimal,
}

async fn submit_bid(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<SubmitBidRequest>,
) -> Response {
    respond(state.dispatcher.submit_bid(
        RideRequestId(id),
        UserId(body.bidder_id),
        body.role,
        body.amount,
    ))
}

#[derive(serde::Deserialize)]
struct AcceptRequest {
    bid_id: u64,
    actor_id: u64,
}

async fn accept_bid(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<AcceptRequest>,
) -> Response {
    respond(
        state
            .dispatcher
            .accept_bid(RideRequestId(id), BidId(body.bid_id), UserId(body.actor_id)),
    )
}

#[derive(serde::Deserialize)]
struct DriverSignal {
    driver_id: u64,
}

async fn start_ride(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<DriverSignal>,
) -> Response {
    respond(state.dispatcher.start_ride(RideRequestId(id), UserId(body.driver_id)))
}

async fn complete_ride(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<DriverSignal>,
) -> Response {
    respond(state.dispatcher.complete_ride(RideRequestId(id), UserId(body.driver_id)))
}

#[derive(serde::Deserialize)]
struct CancelRequest {
    actor_id: u64,
    reason: CancelReason,
}

async fn cancel_ride(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<CancelRequest>,
) -> Response {
    respond(
        state
            .dispatcher
            .cancel(RideRequestId(id), UserId(body.actor_id), body.reason),
    )
}

async fn rider_history(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    (StatusCode::OK, Json(state.dispatcher.history_for_rider(UserId(id)))).into_response()
}

async fn driver_history(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    (StatusCode::OK, Json(state.dispatcher.history_for_driver(UserId(id)))).into_response()
}

async fn driver_earnings(Extension(state): Extension<AppState>, Path(id): Path<u64>) -> Response {
    respond(state.dispatcher.earnings_for_driver(UserId(id)))
}

async fn driver_location(
    Extension(state): Extension<AppState>,
    Json(ping): Json<LocationPing>,
) -> Response {
    respond(state.dispatcher.apply_ping(&ping))
}

#[derive(serde::Deserialize)]
struct AvailabilityRequest {
    available: bool,
}

async fn driver_availability(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<AvailabilityRequest>,
) -> Response {
    respond(state.dispatcher.set_availability(UserId(id), body.available))
}

#[derive(serde::Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    radius_m: Option<f64>,
    limit: Option<usize>,
}

async fn drivers_nearby(
    Extension(state): Extension<AppState>,
    Query(q): Query<NearbyQuery>,
) -> Response {
    let config = state.dispatcher.config();
    let radius_m = q.radius_m.unwrap_or(config.search_radius_m);
    let limit = q.limit.unwrap_or(config.nearby_limit);
    respond(
        state
            .dispatcher
            .query_nearby(Coordinate::new(q.lat, q.lng), radius_m, limit),
    )
}

async fn ws_ride_events(
    Extension(state): Extension<AppState>,
    Path(id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.dispatcher.subscribe(RideRequestId(id)) {
        Ok(stream) => ws.on_upgrade(move |socket| forward_events(socket, stream)),
        Err(e) => error_response(e),
    }
}

/// One JSON text frame per event, then a close frame after the terminal event.
async fn forward_events(mut socket: WebSocket, mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        let text = match serde_json::to_string(&event) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if socket.send(Message::Text(text)).await.is_err() {
            debug!("event subscriber disconnected ride_id={}", event.ride_request_id);
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
