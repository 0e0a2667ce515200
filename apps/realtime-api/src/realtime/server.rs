//! WebSocket upgrade, per-connection read/write loops, and the realtime HTTP
//! endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::auth::api_key::{extract_api_key, validate_api_key, ServiceKey};
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

use super::connection::{handle_message, Connection};
use super::events::{ChangeEventType, Row};
use super::hub::HubStats;
use super::protocol;
use super::service::RealtimeService;

/// Largest accepted inbound message or frame.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Without a pong for this long the peer is considered gone.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Transport ping period; must stay below [`READ_DEADLINE`].
const PING_PERIOD: Duration = Duration::from_secs(25);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/realtime/v1/websocket", get(ws_upgrade))
        .route("/realtime/v1/stats", get(stats))
        .route("/realtime/v1/notify", post(notify))
}

// ---------------------------------------------------------------------------
// GET /realtime/v1/websocket
// ---------------------------------------------------------------------------

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(key) = extract_api_key(&query, &headers) else {
        return ApiError::unauthorized("Missing API key").into_response();
    };
    if let Err(e) = validate_api_key(&key, &state.config, state.realtime.verifier()) {
        return e.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let realtime = state.realtime.clone();
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_connection(socket, realtime))
}

async fn run_connection(socket: WebSocket, realtime: RealtimeService) {
    let (conn, outbound) = realtime.connect();
    let conn_id = conn.id().to_string();
    tracing::info!(%conn_id, "realtime connection opened");

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        outbound,
        realtime.shutdown_token(),
        conn_id.clone(),
    ));
    let mut reader = tokio::spawn(read_loop(ws_rx, conn.clone(), realtime.clone()));

    // Whichever loop ends first takes the other down with it.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    realtime.disconnect(&conn);
    tracing::info!(%conn_id, "realtime connection closed");
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    realtime: RealtimeService,
) {
    let mut deadline = Instant::now() + READ_DEADLINE;

    loop {
        let frame = match time::timeout_at(deadline, ws_rx.next()).await {
            Err(_elapsed) => {
                tracing::debug!(conn_id = %conn.id(), "read deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "ws read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match &frame {
            WsMessage::Text(text) => protocol::decode(text.as_str().as_bytes()),
            WsMessage::Binary(bytes) => protocol::decode(bytes),
            WsMessage::Pong(_) => {
                deadline = Instant::now() + READ_DEADLINE;
                continue;
            }
            WsMessage::Ping(_) => continue,
            WsMessage::Close(_) => break,
        };

        match decoded {
            Ok(msg) => handle_message(realtime.hub(), realtime.verifier(), &conn, msg),
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "dropping undecodable frame");
            }
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    conn_id: String,
) {
    let mut ping = time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    tracing::debug!(%conn_id, error = %e, "ws write error");
                    break;
                }
            }
            () = shutdown.cancelled() => {
                tracing::debug!(%conn_id, "closing for shutdown");
                break;
            }
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Bytes::new())).await {
                    tracing::debug!(%conn_id, error = %e, "ws ping failed");
                    break;
                }
            }
        }
    }

    let _ = ws_tx.close().await;
}

// ---------------------------------------------------------------------------
// GET /realtime/v1/stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/realtime/v1/stats",
    tag = "Realtime",
    security(("apikey" = [])),
    responses(
        (status = 200, description = "Connection and channel counts", body = HubStats),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
        (status = 403, description = "Service key required", body = ApiErrorBody),
    ),
)]
pub async fn stats(_key: ServiceKey, State(state): State<AppState>) -> Json<HubStats> {
    Json(state.realtime.stats())
}

// ---------------------------------------------------------------------------
// POST /realtime/v1/notify
// ---------------------------------------------------------------------------

fn public_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NotifyRequest {
    #[serde(default = "public_schema")]
    pub schema: String,
    pub table: String,
    /// `INSERT`, `UPDATE` or `DELETE`.
    #[serde(rename = "type")]
    #[schema(value_type = String)]
    pub event_type: ChangeEventType,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub record: Option<Row>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub old_record: Option<Row>,
}

impl NotifyRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.table.trim().is_empty() {
            return Err(ApiError::bad_request("table is required"));
        }
        match self.event_type {
            ChangeEventType::Insert | ChangeEventType::Update if self.record.is_none() => {
                Err(ApiError::bad_request("record is required for INSERT and UPDATE"))
            }
            ChangeEventType::Delete if self.old_record.is_none() => {
                Err(ApiError::bad_request("old_record is required for DELETE"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotifyResponse {
    pub delivered: usize,
}

#[utoipa::path(
    post,
    path = "/realtime/v1/notify",
    tag = "Realtime",
    security(("apikey" = [])),
    request_body = NotifyRequest,
    responses(
        (status = 202, description = "Change dispatched to subscribers", body = NotifyResponse),
        (status = 400, description = "Invalid change", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ApiErrorBody),
        (status = 403, description = "Service key required", body = ApiErrorBody),
    ),
)]
pub async fn notify(
    _key: ServiceKey,
    State(state): State<AppState>,
    Json(body): Json<NotifyRequest>,
) -> Result<(StatusCode, Json<NotifyResponse>), ApiError> {
    body.validate()?;

    // Inserts carry no pre-image and deletes no post-image.
    let (old_record, record) = match body.event_type {
        ChangeEventType::Insert => (None, body.record),
        ChangeEventType::Update => (body.old_record, body.record),
        ChangeEventType::Delete => (body.old_record, None),
    };

    let delivered = state
        .realtime
        .notify_change(&body.schema, &body.table, body.event_type, old_record, record)
        .await;
    Ok((StatusCode::ACCEPTED, Json(NotifyResponse { delivered })))
}
