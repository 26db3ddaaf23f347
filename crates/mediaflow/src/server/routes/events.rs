//! Server-sent stream of relayed worker events

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use crate::coordinator::Coordinator;

/// GET /api/events
///
/// Each event carries `{message_type, content}` as JSON data. A subscriber that falls
/// behind skips the events it missed.
pub async fn stream_events(
    State(coordinator): State<Coordinator>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(coordinator.subscribe()).filter_map(|received| {
        match received {
            Ok(event) => match Event::default().event(&event.message_type).json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    tracing::warn!("Unencodable event {}: {}", event.message_type, e);
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!("Event subscriber lagged, skipped {}", skipped);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
