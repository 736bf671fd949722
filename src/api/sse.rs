//! Server-Sent Events for the change feed

use crate::store::ChangeEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// Convert the change feed to an SSE stream
///
/// Opens with a `ready` event. A subscriber that falls behind gets a `lagged`
/// event with the number of changes it missed and should refetch listings.
/// The stream ends when `shutdown` fires so graceful shutdown can finish.
pub fn sse_stream(
    changes: tokio::sync::broadcast::Receiver<ChangeEvent>,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ready = stream::once(async {
        Ok::<_, Infallible>(
            Event::default()
                .event("ready")
                .data(json!({ "type": "ready" }).to_string()),
        )
    });

    let changes = BroadcastStream::new(changes).map(|result| {
        Ok::<_, Infallible>(match result {
            Ok(change) => change_event(&change),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Event::default()
                .event("lagged")
                .data(json!({ "type": "lagged", "missed": missed }).to_string()),
        })
    });

    let events = ready
        .chain(changes)
        .take_until(shutdown.cancelled_owned());

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn change_event(change: &ChangeEvent) -> Event {
    let data = json!({
        "type": "change",
        "change": change,
    });
    Event::default()
        .event("change")
        .id(change.conversation_id.to_string())
        .data(data.to_string())
}
