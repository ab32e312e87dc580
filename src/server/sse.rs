//! Server-Sent Events stream of one run.
//!
//! Each run event becomes one SSE message: `event:` is the kind, `data:` the
//! event as JSON and `id:` its sequence number. The stream replays what already
//! happened, follows the run live and ends after the terminal event.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;

use crate::events::Event;

use super::api::{ApiError, SharedState, parse_run_id};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn to_sse(event: &Event) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(json) => Some(
            SseEvent::default()
                .event(event.kind.as_str())
                .id(event.seq.to_string())
                .data(json),
        ),
        Err(e) => {
            tracing::warn!(run_id = %event.run_id, seq = event.seq, error = %e, "Failed to serialize event for SSE");
            None
        }
    }
}

/// `GET /api/runs/{id}/events`
pub async fn run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let mut subscription = state.service.subscribe(run_id).await?;
    tracing::debug!(run_id = %run_id, "SSE subscriber attached");

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next().await {
            if let Some(message) = to_sse(&event) {
                yield Ok(message);
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("ping"),
    ))
}
