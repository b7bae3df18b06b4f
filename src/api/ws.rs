use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use crate::notify::{Channel, Notification};
use crate::roles::Actor;

use super::AppState;
use super::auth::authenticate;
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Upgrade to a live notification feed: the caller's private channel, plus
/// the admin channel for staff.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Result<Response, ApiError> {
    let token = params
        .token
        .ok_or_else(|| ApiError::Unauthorized("a session token is required".into()))?;
    let actor = authenticate(&state, &token).await?;
    let mut channels = Vec::new();
    if let Some(user_id) = actor.user_id {
        channels.push(Channel::User(user_id));
    }
    if actor.is_staff() {
        channels.push(Channel::Admin);
    }
    let receivers = channels
        .into_iter()
        .map(|c| state.engine.notify.subscribe(c))
        .collect();
    Ok(ws.on_upgrade(move |socket| serve(socket, actor, receivers)).into_response())
}

async fn serve(socket: WebSocket, actor: Actor, receivers: Vec<broadcast::Receiver<Notification>>) {
    let (tx, mut rx) = mpsc::channel::<Notification>(64);
    let forwarders: Vec<_> = receivers
        .into_iter()
        .map(|sub| tokio::spawn(forward(sub, tx.clone())))
        .collect();
    drop(tx);

    let user = actor.username.clone().unwrap_or_default();
    tracing::info!(user = %user, role = actor.role.as_str(), "live feed connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(notification) = outbound else { break };
                let text = match serde_json::to_string(&notification) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "unserializable notification dropped");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "live feed receive error");
                    break;
                }
            },
        }
    }

    for f in forwarders {
        f.abort();
    }
    tracing::info!(user = %user, "live feed disconnected");
}

/// Pump one broadcast subscription into the connection's queue.
async fn forward(mut sub: broadcast::Receiver<Notification>, tx: mpsc::Sender<Notification>) {
    loop {
        match sub.recv().await {
            Ok(n) => {
                if tx.send(n).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "live feed lagging, notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
