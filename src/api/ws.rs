//! WebSocket push channel at `/api/v1/events` (spec §6.1, §4.10). Clients may
//! send a `{subscribe:[...]}` frame to narrow which event kinds they receive;
//! an empty or absent filter means "everything". Backpressure is handled the
//! same way the underlying `EventBus` handles it for every subscriber: a slow
//! client lags and misses non-durable events rather than stalling the
//! publisher (spec §4.9/§4.10 — only `TallyChanged` is droppable-if-superseded,
//! everything else must eventually reach a caught-up client).

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::debug;

use crate::events::{EventFilter, EventRecvError};

use super::AppState;

#[derive(Debug, Deserialize)]
struct SubscribeFrame {
    #[serde(default)]
    subscribe: Vec<String>,
}

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();
    let mut filter = EventFilter::all();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<SubscribeFrame>(&text) {
                            filter = if frame.subscribe.is_empty() {
                                EventFilter::all()
                            } else {
                                EventFilter::only(frame.subscribe)
                            };
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "events websocket read error");
                        return;
                    }
                }
            }
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(EventRecvError::Lagged(n)) => {
                        debug!(skipped = n, "events websocket subscriber lagged");
                        continue;
                    }
                    Err(EventRecvError::Closed) => return,
                };
                if !filter.matches(&event) {
                    continue;
                }
                let Ok(body) = serde_json::to_string(&*event) else { continue };
                if socket.send(Message::Text(body)).await.is_err() {
                    return;
                }
            }
        }
    }
}
