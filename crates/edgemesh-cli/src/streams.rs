//! Server-sent event endpoints.
//!
//! GET /v1/stream/nodes and /v1/stream/jobs subscribe to the event bus and
//! forward updates as SSE events (`node_update` / `job_update`). Publishers
//! never wait on a subscriber: when a slow consumer overflows its queue the
//! oldest events are dropped and the next delivered event carries a
//! cumulative `drop_count` so the client knows to re-read state.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{self as stream, Stream, StreamExt};

use crate::serve_cmd::AppState;

pub async fn stream_nodes(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.coordinator.bus().subscribe_nodes();
    sse_response(rx, "node_update")
}

pub async fn stream_jobs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.coordinator.bus().subscribe_jobs();
    sse_response(rx, "job_update")
}

fn sse_response<T>(
    rx: broadcast::Receiver<T>,
    event_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Clone + Send + 'static,
{
    let connected =
        stream::once(Ok::<_, Infallible>(Event::default().event("connected").data("ok")));
    Sse::new(connected.chain(bus_events(rx, event_name))).keep_alive(KeepAlive::default())
}

/// Map bus deliveries to SSE events, folding broadcast lag into a
/// monotonically increasing `drop_count` on the next delivered event.
fn bus_events<T>(
    rx: broadcast::Receiver<T>,
    event_name: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Serialize + Clone + Send + 'static,
{
    let mut drop_count: u64 = 0;
    BroadcastStream::new(rx).filter_map(move |delivery| match delivery {
        Ok(update) => {
            let mut data = match serde_json::to_value(&update) {
                Ok(value) => value,
                Err(_) => return None,
            };
            if drop_count > 0 {
                if let Some(object) = data.as_object_mut() {
                    object.insert("drop_count".to_owned(), drop_count.into());
                }
            }
            Event::default()
                .event(event_name)
                .json_data(&data)
                .ok()
                .map(Ok)
        }
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            drop_count += n;
            None
        }
    })
}
