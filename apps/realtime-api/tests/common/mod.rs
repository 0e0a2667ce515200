#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_api::config::Config;
use realtime_api::rls::{MemoryPolicyStore, RlsService};
use realtime_api::AppState;

pub const JWT_SECRET: &str = "realtime-integration-secret";
pub const ANON_KEY: &str = "anon-integration-key";
pub const SERVICE_KEY: &str = "service-integration-key";

/// Upper bound for any single await on the socket.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config() -> Config {
    Config {
        jwt_secret: JWT_SECRET.to_string(),
        anon_key: ANON_KEY.to_string(),
        service_key: SERVICE_KEY.to_string(),
        port: 0,
        send_queue_capacity: 64,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub fn ws_url(&self, key: &str) -> String {
        format!("ws://{}/realtime/v1/websocket?apikey={key}&vsn=1.0.0", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn connect(&self) -> Ws {
        connect_url(&self.ws_url(ANON_KEY)).await
    }

    /// Poll stats until the connection count reaches `expected`, returning the
    /// last snapshot either way.
    pub async fn wait_for_connections(&self, expected: u64) -> Value {
        let mut stats = self.stats().await;
        for _ in 0..50 {
            if stats["connections"] == expected {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
            stats = self.stats().await;
        }
        stats
    }

    /// `GET /realtime/v1/stats` with the service key.
    pub async fn stats(&self) -> Value {
        reqwest::Client::new()
            .get(self.http_url("/realtime/v1/stats"))
            .header("apikey", SERVICE_KEY)
            .send()
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats body")
    }
}

/// Start the real router on an ephemeral port.
pub async fn spawn_server(rls: Arc<dyn RlsService>) -> TestServer {
    let state = AppState::new(test_config(), rls);
    let app = realtime_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}

pub async fn spawn_default_server() -> TestServer {
    spawn_server(Arc::new(MemoryPolicyStore::new())).await
}

pub fn mint_token(sub: &str, role: &str) -> String {
    mint_with_exp(sub, role, chrono::Utc::now().timestamp() + 600)
}

pub fn mint_expired_token(sub: &str, role: &str) -> String {
    mint_with_exp(sub, role, chrono::Utc::now().timestamp() - 600)
}

fn mint_with_exp(sub: &str, role: &str, exp: i64) -> String {
    let claims = json!({ "sub": sub, "role": role, "exp": exp });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn connect_url(url: &str) -> Ws {
    try_connect(url, None).await.expect("ws connect")
}

/// Open a socket, optionally sending the API key as an `apikey` header.
pub async fn try_connect(url: &str, apikey_header: Option<&str>) -> Result<Ws, tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(key) = apikey_header {
        request
            .headers_mut()
            .insert("apikey", key.parse().expect("header value"));
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// `[join_ref, ref, topic, event, payload]`
pub fn frame(join_ref: Option<&str>, msg_ref: &str, topic: &str, event: &str, payload: Value) -> Value {
    json!([join_ref, msg_ref, topic, event, payload])
}

pub async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next application frame, decoded from the JSON array form.
pub async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Skip frames until one with `event` arrives.
pub async fn recv_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let frame = recv(ws).await;
        if frame[3] == event {
            return frame;
        }
    }
}

/// Skip frames until the reply to `msg_ref` arrives.
pub async fn recv_reply(ws: &mut Ws, msg_ref: &str) -> Value {
    loop {
        let frame = recv(ws).await;
        if frame[3] == "phx_reply" && frame[1] == msg_ref {
            return frame;
        }
    }
}

/// Assert no application frame arrives within `wait`.
pub async fn assert_silent(ws: &mut Ws, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Read until the server ends the socket, by close frame, reset or EOF.
pub async fn expect_closed(ws: &mut Ws) {
    loop {
        match time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
}

/// Join `topic` and return the reply payload.
pub async fn join(ws: &mut Ws, topic: &str, join_ref: &str, payload: Value) -> Value {
    send(ws, frame(Some(join_ref), join_ref, topic, "phx_join", payload)).await;
    recv_reply(ws, join_ref).await[4].clone()
}
