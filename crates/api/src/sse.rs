//! Live file-change notifications (§6 `GET /api/files/events`).
//!
//! One SSE connection per caller, fed by [`nimbus_core::SseBroadcaster`]
//! — the Tree Engine publishes a [`StreamEvent`] after every successful
//! mutation, and this handler just forwards the caller's slice of that
//! fan-out. Delivery is best-effort: a connection that drops and
//! reconnects has missed whatever fired while it was away (§4.C9).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use nimbus_core::StreamEvent;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::extractors::AuthUser;
use crate::middleware::AppState;

pub async fn file_events(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe(&user.id).await;
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => Some(Ok(to_sse_event(&event))),
        // A lagged receiver just misses the events it fell behind on;
        // the stream itself keeps running (§4.C9 "best-effort").
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    )
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(sse_event) => sse_event,
        Err(_) => Event::default().event("error").data("serialization failed"),
    }
}
