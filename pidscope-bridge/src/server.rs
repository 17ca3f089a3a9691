//! Subscriber-facing HTTP server.
//!
//! Routes:
//! - `GET /events`: server-sent event stream of device events
//! - `POST /events`: one inbound message (setpoint write)
//! - `GET /ws`: WebSocket carrying events out and messages in
//! - `GET /status`: [`StatusSnapshot`] as JSON
//! - `PUT /options`: change read count and/or sampling rate

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::PollOptions;
use crate::connection::ConnectionManager;
use crate::error::InboundError;
use crate::hub::{BroadcastHub, ChannelSubscriber, SubscriberId};
use crate::poller::PollingEngine;
use crate::status::StatusSnapshot;

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub engine: Arc<PollingEngine>,
    pub connection: Arc<ConnectionManager>,
    /// Per-subscriber event buffer.
    pub buffer: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(event_stream).post(post_message))
        .route("/ws", get(websocket))
        .route("/status", get(status))
        .route("/options", put(update_options))
        .with_state(state)
}

/// Serve subscribers on `listener` until the task is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Subscriber server listening");
    axum::serve(listener, router(state)).await
}

/// Unsubscribes when the owning stream is dropped.
struct SubscriptionGuard {
    hub: Arc<BroadcastHub>,
    id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    hub.unsubscribe(id).await;
                });
            }
            Err(_) => warn!(subscriber = id, "No runtime; subscriber not unsubscribed"),
        }
    }
}

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber, mut rx) = ChannelSubscriber::channel(state.buffer);
    let id = state.hub.subscribe(Arc::new(subscriber));
    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        id,
    };
    debug!(subscriber = id, "SSE stream opened");

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(payload) = rx.recv().await {
            yield Ok(Event::default().data(&*payload));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_message(State(state): State<AppState>, body: String) -> Response {
    inbound_response(state.hub.handle_inbound(None, &body).await)
}

fn inbound_response(result: Result<(), InboundError>) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e @ InboundError::Message(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ InboundError::Write(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut incoming) = socket.split();
    let (subscriber, mut rx) = ChannelSubscriber::channel(state.buffer);
    let id = state.hub.subscribe(Arc::new(subscriber));
    debug!(subscriber = id, "WebSocket opened");

    let mut outbound = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hub = state.hub.clone();
    let mut inbound = tokio::spawn(async move {
        while let Some(Ok(message)) = incoming.next().await {
            match message {
                Message::Text(text) => {
                    if let Err(e) = hub.handle_inbound(Some(id), &text).await {
                        debug!(subscriber = id, error = %e, "Inbound message failed");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }

    state.hub.unsubscribe(id).await;
    debug!(subscriber = id, "WebSocket closed");
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot::capture(
        &state.connection,
        &state.engine,
        &state.hub,
    ))
}

async fn update_options(
    State(state): State<AppState>,
    Json(options): Json<PollOptions>,
) -> Response {
    match state.engine.set_options(&options) {
        Ok(settings) => Json(json!({
            "readCount": settings.read_count,
            "intervalMs": settings.interval.as_millis() as u64,
        }))
        .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
