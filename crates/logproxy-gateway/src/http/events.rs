//! `GET /events/`: one Server-Sent Events stream per viewer.
//!
//! The handler registers a consumer and hands its subscription to the
//! response stream. When the client goes away hyper drops the stream, the
//! subscription drops with it, and the consumer is deregistered.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use logproxy_core::config::SSE_EVENT_NAME;
use tracing::debug;

use crate::app::AppState;
use crate::http::error::ApiError;

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    let mut subscription = state.broadcaster.register()?;
    let keep_alive = Duration::from_secs(state.config.broadcast.keep_alive_secs.max(1));

    let stream = async_stream::stream! {
        while let Some(payload) = subscription.recv().await {
            yield Ok(Event::default()
                .event(SSE_EVENT_NAME)
                .id(payload.seq.to_string())
                .data(payload.json));
        }
        debug!(consumer_id = %subscription.id(), "event stream closed by server");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive")))
}
