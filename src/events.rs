//! Ride events and the per-ride subscription stream.

use futures_util::stream::{self, Stream};
use log::warn;
use rust_decimal::Decimal;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

use crate::ledger::Bid;
use crate::types::{BidId, CancelReason, RideRequestId, RideState, Timestamp, UserId};

/// One entry of a ride's push feed. Serializes as
/// `{"ride_request_id": .., "type": .., "payload": .., "timestamp": ..}`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RideEvent {
    pub ride_request_id: RideRequestId,
    #[serde(flatten)]
    pub kind: RideEventKind,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RideEventKind {
    BidSubmitted(Bid),
    BidAccepted {
        bid_id: BidId,
        driver_id: UserId,
        amount: Decimal,
    },
    StateChanged {
        from: RideState,
        to: RideState,
    },
    Cancelled {
        reason: CancelReason,
        had_accepted_bid: bool,
    },
}

impl RideEvent {
    /// Last event a subscriber will see for this ride.
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            RideEventKind::Cancelled { .. } => true,
            RideEventKind::StateChanged { to, .. } => *to == RideState::Completed,
            _ => false,
        }
    }
}

/// Live events for one ride, ending after the terminal event.
///
/// Not restartable: each call to subscribe yields a new stream starting at the current
/// point of the feed. A subscriber that falls behind the channel buffer skips the missed
/// events.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = RideEvent> + Send>>,
}

impl EventStream {
    pub(crate) fn live(rx: broadcast::Receiver<RideEvent>) -> Self {
        let inner = stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((event, next));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event subscriber lagged skipped={}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Stream for a ride that already reached a terminal state.
    pub(crate) fn finished() -> Self {
        Self {
            inner: Box::pin(stream::empty()),
        }
    }
}

impl Stream for EventStream {
    type Item = RideEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
