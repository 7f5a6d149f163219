//! Websocket transport: one task per connection, pumping frames between the
//! socket and the dispatcher.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::identity::bearer_token;
use crate::model::Identity;

use super::dispatcher::Dispatcher;

#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// GET /ws - Upgrade to the real-time channel.
///
/// The credential comes from `?token=` or an `Authorization: Bearer` header
/// and is checked before the upgrade; unknown credentials get a 401.
#[instrument(skip_all)]
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&state, query, &headers).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| run_session(socket, dispatcher, identity))
}

async fn authenticate(state: &AppState, query: SocketQuery, headers: &HeaderMap) -> AppResult<Identity> {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .or(header_token)
        .ok_or_else(|| AppError::unauthorized("No token provided"))?;

    state.directory.resolve(&token).await
}

async fn run_session(mut socket: WebSocket, dispatcher: Dispatcher, identity: Identity) {
    let (session, mut outbound) = dispatcher.connect(identity).await;

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(frame))) => dispatcher.handle_frame(session, &frame).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session, error = %e, "Websocket receive failed");
                    break;
                }
            },
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session, error = %e, "Failed to encode outbound event");
                        continue;
                    }
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatcher.disconnect(session).await;
}
