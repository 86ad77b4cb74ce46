//! WebSocket transport over axum.
//!
//! # Routes
//!
//! - `GET /ws/chat?room_id=<uuid>[&reconnect=true]`
//! - `GET /ws/call?room_id=<uuid>[&reconnect=true]`
//! - `GET /healthz`
//!
//! Browser origins are checked against [`TransportConfig::allowed_origins`]
//! (403 on mismatch), then the bearer token is verified before the upgrade;
//! failures get a 401. Both carry a JSON `{code, message}` body. Everything after the upgrade (membership,
//! call state, duplicates) is reported in-band: an `error` envelope followed
//! by a close frame.
//!
//! Each socket runs a reader (this task) and a writer task. The writer owns
//! the sink and drains the connection's [`OutboundQueue`]; the reader feeds
//! frames to the engine and stops as soon as the queue starts closing.
//! Every frame write is bounded by [`TransportConfig::write_timeout`], so a
//! peer that stops reading loses its socket instead of pinning the writer.

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
    },
    http::{
        HeaderMap, StatusCode,
        header::{AUTHORIZATION, ORIGIN},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use switchyard_core::Environment;
use switchyard_proto::{CloseCode, Envelope, ErrorPayload, RoomKind};
use uuid::Uuid;

use crate::{
    collaborators::AuthError,
    config::TransportConfig,
    engine::{AdmitRequest, Flow},
    hub::{HealthReport, Hub},
    metrics::HubMetrics,
    outbound::{Next, OutboundQueue},
    registry::ConnectionId,
};

/// Query string of the WebSocket endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConnectParams {
    /// Room to enter
    pub room_id: Uuid,
    /// Resume an earlier session
    #[serde(default)]
    pub reconnect: bool,
}

/// Shared state of the routes.
struct AppState<E: Environment> {
    hub: Arc<Hub<E>>,
    transport: Arc<TransportConfig>,
}

impl<E: Environment> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self { hub: Arc::clone(&self.hub), transport: Arc::clone(&self.transport) }
    }
}

/// Routes for one hub.
pub fn router<E: Environment>(hub: Arc<Hub<E>>, transport: TransportConfig) -> Router {
    Router::new()
        .route("/ws/chat", get(chat_upgrade::<E>))
        .route("/ws/call", get(call_upgrade::<E>))
        .route("/healthz", get(healthz::<E>))
        .with_state(AppState { hub, transport: Arc::new(transport) })
}

async fn chat_upgrade<E: Environment>(
    State(app): State<AppState<E>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(app, RoomKind::Chat, params, &headers, ws)
}

async fn call_upgrade<E: Environment>(
    State(app): State<AppState<E>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(app, RoomKind::Call, params, &headers, ws)
}

async fn healthz<E: Environment>(State(app): State<AppState<E>>) -> Json<HealthReport> {
    Json(app.hub.health())
}

fn upgrade<E: Environment>(
    app: AppState<E>,
    kind: RoomKind,
    params: ConnectParams,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !app.hub.is_accepting() {
        let body = ErrorPayload::new("shutting_down", "server is shutting down");
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    if !origin_allowed(&app.transport.allowed_origins, headers) {
        tracing::info!(room_id = %params.room_id, origin = ?headers.get(ORIGIN), "Upgrade from foreign origin");
        let body = ErrorPayload::new("forbidden_origin", "origin not allowed");
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    let identity = match bearer(headers).and_then(|token| app.hub.verifier().verify(token)) {
        Ok(identity) => identity,
        Err(error) => {
            tracing::info!(room_id = %params.room_id, %error, "Upgrade rejected");
            let body = ErrorPayload::unauthenticated(error.to_string());
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        },
    };

    let request = AdmitRequest { room_id: params.room_id, kind, identity, reconnect: params.reconnect };
    let write_timeout = app.transport.write_timeout;
    ws.on_upgrade(move |socket| serve_socket(app.hub, request, socket, write_timeout))
}

/// No allow-list, or no `Origin` header, lets the request through.
fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    origin.to_str().is_ok_and(|origin| allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)))
}

fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::Missing)
}

async fn serve_socket<E: Environment>(
    hub: Arc<Hub<E>>,
    request: AdmitRequest,
    socket: WebSocket,
    write_timeout: Duration,
) {
    hub.metrics().socket_opened();
    session(&hub, request, socket, write_timeout).await;
    hub.metrics().socket_closed();
}

async fn session<E: Environment>(hub: &Arc<Hub<E>>, request: AdmitRequest, socket: WebSocket, write_timeout: Duration) {
    let (mut sink, stream) = socket.split();

    let membership = match hub.engine().admit(request).await {
        Ok(membership) => membership,
        Err(error) => {
            tracing::info!(room_id = %request.room_id, identity = %request.identity, %error, "Admission failed");
            let envelope = Envelope::error(request.room_id, error.to_payload(), hub.env().wall_clock());
            if let Ok(text) = envelope.to_json() {
                let _ = tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await;
            }
            let _ = tokio::time::timeout(write_timeout, sink.send(close_message(error.close_code()))).await;
            return;
        },
    };

    let connection_id = membership.connection_id;
    let mut writer = tokio::spawn(write_loop(Arc::clone(&membership.queue), sink, write_timeout));

    read_loop(hub, connection_id, &membership.queue, stream).await;

    hub.engine().disconnect(connection_id).await;

    // A live peer drains well within this; a stuck one is abandoned
    match tokio::time::timeout(write_timeout.saturating_mul(2), &mut writer).await {
        Ok(Ok(())) => {},
        Ok(Err(error)) => tracing::error!(%connection_id, %error, "Writer task failed"),
        Err(_) => {
            tracing::warn!(%connection_id, "Writer did not stop, aborting");
            writer.abort();
        },
    }
}

async fn read_loop<E: Environment>(
    hub: &Hub<E>,
    connection_id: ConnectionId,
    queue: &OutboundQueue,
    mut stream: SplitStream<WebSocket>,
) {
    loop {
        let next = tokio::select! {
            () = queue.closing().cancelled() => break,
            next = stream.next() => next,
        };

        let flow = match next {
            Some(Ok(Message::Text(text))) => hub.engine().handle_text(connection_id, text.as_str()).await,
            Some(Ok(Message::Binary(_))) => hub.engine().handle_binary(connection_id),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                hub.engine().touch(connection_id);
                Flow::Continue
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(error)) => {
                tracing::debug!(%connection_id, %error, "Socket read failed");
                break;
            },
        };

        if let Flow::Close(code) = flow {
            tracing::debug!(%connection_id, %code, "Closing after inbound frame");
            break;
        }
    }
}

async fn write_loop(queue: Arc<OutboundQueue>, mut sink: SplitSink<WebSocket, Message>, write_timeout: Duration) {
    loop {
        let (message, last) = match queue.next().await {
            Next::Envelope(envelope) => match envelope.to_json() {
                Ok(text) => (Message::Text(text.into()), false),
                Err(error) => {
                    tracing::error!(%error, "Failed to encode envelope");
                    continue;
                },
            },
            Next::Ping => (Message::Ping(Bytes::new()), false),
            Next::Close(code) => (close_message(code), true),
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                tracing::debug!(%error, "Socket write failed");
                queue.close(CloseCode::Normal);
                break;
            },
            Err(_) => {
                tracing::warn!(timeout = ?write_timeout, pending = queue.len(), "Socket write timed out, dropping peer");
                queue.close(CloseCode::Normal);
                break;
            },
        }

        if last {
            break;
        }
    }
}

fn close_message(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame { code: code.code(), reason: Utf8Bytes::from_static(code.reason()) }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), Err(AuthError::Missing));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), Err(AuthError::Missing));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), Err(AuthError::Missing));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-123"));
        assert_eq!(bearer(&headers), Ok("tok-123"));
    }

    #[test]
    fn close_frames_carry_code_and_reason() {
        let Message::Close(Some(frame)) = close_message(CloseCode::HeartbeatTimeout) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 4004);
        assert_eq!(frame.reason.as_str(), "heartbeat timeout");
    }

    #[test]
    fn origin_allow_list() {
        let allowed = vec!["https://app.example.com".to_string()];
        let mut headers = HeaderMap::new();

        assert!(origin_allowed(&[], &headers));
        assert!(origin_allowed(&allowed, &headers));

        headers.insert(ORIGIN, HeaderValue::from_static("https://evil.example.net"));
        assert!(origin_allowed(&[], &headers));
        assert!(!origin_allowed(&allowed, &headers));

        headers.insert(ORIGIN, HeaderValue::from_static("https://APP.example.com"));
        assert!(origin_allowed(&allowed, &headers));
    }

    #[test]
    fn connect_params_default_to_fresh() {
        let params: ConnectParams =
            serde_json::from_str(r#"{"room_id":"00000000-0000-0000-0000-000000000001"}"#).unwrap();
        assert!(!params.reconnect);
    }
}
