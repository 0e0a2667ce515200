mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite;

use common::{
    assert_silent, expect_closed, frame, join, mint_expired_token, mint_token, recv, recv_event,
    recv_reply, send, ANON_KEY, SERVICE_KEY,
};
use realtime_api::realtime::protocol::{encode_binary, Message};
use realtime_api::rls::{MemoryPolicyStore, Policy};

const QUIET: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Upgrade and API keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_rejects_invalid_api_key() {
    let server = common::spawn_default_server().await;

    let err = common::try_connect(&server.ws_url("not-a-key"), None)
        .await
        .expect_err("upgrade should be refused");
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }

    let resp = reqwest::get(server.http_url("/realtime/v1/websocket"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn upgrade_accepts_header_and_jwt_keys() {
    let server = common::spawn_default_server().await;
    let url = format!("ws://{}/realtime/v1/websocket", server.addr);

    let mut ws = common::try_connect(&url, Some(ANON_KEY)).await.unwrap();
    send(&mut ws, frame(None, "1", "phoenix", "heartbeat", json!({}))).await;
    recv_reply(&mut ws, "1").await;

    let anon_jwt = mint_token("anon-user", "anon");
    common::try_connect(&server.ws_url(&anon_jwt), None)
        .await
        .unwrap();

    let user_jwt = mint_token("u1", "authenticated");
    assert!(common::try_connect(&server.ws_url(&user_jwt), None).await.is_err());
}

#[tokio::test]
async fn stats_and_notify_require_service_key() {
    let server = common::spawn_default_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.http_url("/realtime/v1/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(server.http_url("/realtime/v1/stats"))
        .header("apikey", ANON_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .post(server.http_url("/realtime/v1/notify"))
        .bearer_auth(ANON_KEY)
        .json(&json!({ "table": "todos", "type": "INSERT", "record": { "id": 1 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_is_answered_on_phoenix_topic() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;

    send(&mut ws, frame(None, "7", "phoenix", "heartbeat", json!({}))).await;
    let reply = recv(&mut ws).await;
    assert_eq!(
        reply,
        json!([null, "7", "phoenix", "phx_reply", { "status": "ok", "response": {} }])
    );
}

#[tokio::test]
async fn object_form_and_bad_frames() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;

    // Undecodable frames are dropped without closing the socket.
    ws.send(tungstenite::Message::Text("garbage".into()))
        .await
        .unwrap();
    ws.send(tungstenite::Message::Text("[1,2]".into()))
        .await
        .unwrap();

    send(
        &mut ws,
        json!({
            "topic": "realtime:room1",
            "event": "phx_join",
            "payload": { "config": {} },
            "ref": "1",
            "join_ref": "1"
        }),
    )
    .await;
    let reply = recv_reply(&mut ws, "1").await;
    assert_eq!(reply[0], "1");
    assert_eq!(reply[2], "realtime:room1");
    assert_eq!(reply[4]["status"], "ok");
    assert_eq!(reply[4]["response"], json!({ "postgres_changes": [] }));
}

#[tokio::test]
async fn binary_user_events_are_relayed_as_broadcasts() {
    let server = common::spawn_default_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    join(&mut a, "realtime:bin", "1", json!({ "config": {} })).await;
    join(&mut b, "realtime:bin", "1", json!({ "config": {} })).await;

    let msg = Message::new("realtime:bin", "cursor", json!({ "x": 3 })).with_join_ref("1");
    let bytes = encode_binary(3, &msg).unwrap();
    b.send(tungstenite::Message::Binary(bytes.into())).await.unwrap();

    let got = recv_event(&mut a, "broadcast").await;
    assert_eq!(
        got[4],
        json!({ "type": "broadcast", "event": "cursor", "payload": { "x": 3 } })
    );
}

// ---------------------------------------------------------------------------
// Join, leave, auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn leave_replies_and_rejects_unjoined_topics() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;

    send(&mut ws, frame(Some("1"), "1", "realtime:nowhere", "phx_leave", json!({}))).await;
    let reply = recv_reply(&mut ws, "1").await;
    assert_eq!(reply[4], json!({ "status": "error", "response": { "reason": "not_joined" } }));

    join(&mut ws, "realtime:room1", "2", json!({})).await;
    send(&mut ws, frame(Some("2"), "3", "realtime:room1", "phx_leave", json!({}))).await;
    let reply = recv_reply(&mut ws, "3").await;
    assert_eq!(reply[4]["status"], "ok");
}

#[tokio::test]
async fn private_channels_need_valid_claims() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;

    let reply = join(&mut ws, "realtime:vault", "1", json!({ "config": { "private": true } })).await;
    assert_eq!(reply, json!({ "status": "error", "response": { "reason": "unauthorized" } }));

    let expired = mint_expired_token("u1", "authenticated");
    let reply = join(
        &mut ws,
        "realtime:vault",
        "2",
        json!({ "config": { "private": true }, "access_token": expired }),
    )
    .await;
    assert_eq!(reply["response"]["reason"], "invalid_token");

    let token = mint_token("u1", "authenticated");
    let reply = join(
        &mut ws,
        "realtime:vault",
        "3",
        json!({ "config": { "private": true }, "access_token": token }),
    )
    .await;
    assert_eq!(reply["status"], "ok");

    // The channel stays private for later joiners that do not ask for it.
    let mut other = server.connect().await;
    let reply = join(&mut other, "realtime:vault", "1", json!({})).await;
    assert_eq!(reply["response"]["reason"], "unauthorized");
}

#[tokio::test]
async fn access_token_refresh_attaches_claims() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;

    // A bad refresh is ignored and the connection stays usable.
    send(
        &mut ws,
        frame(None, "1", "realtime:vault", "access_token", json!({ "access_token": "junk" })),
    )
    .await;
    let reply = join(&mut ws, "realtime:vault", "2", json!({ "config": { "private": true } })).await;
    assert_eq!(reply["response"]["reason"], "unauthorized");

    let token = mint_token("u1", "authenticated");
    send(
        &mut ws,
        frame(None, "3", "realtime:vault", "access_token", json!({ "access_token": token })),
    )
    .await;
    let reply = join(&mut ws, "realtime:vault", "4", json!({ "config": { "private": true } })).await;
    assert_eq!(reply["status"], "ok");
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_with_ack_excludes_sender() {
    let server = common::spawn_default_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    let config = json!({ "config": { "broadcast": { "ack": true, "self": false } } });
    join(&mut a, "realtime:room1", "1", config.clone()).await;
    join(&mut b, "realtime:room1", "1", config).await;

    send(
        &mut b,
        frame(
            Some("1"),
            "2",
            "realtime:room1",
            "broadcast",
            json!({ "type": "broadcast", "event": "msg", "payload": { "text": "hi" } }),
        ),
    )
    .await;

    let got = recv(&mut a).await;
    assert_eq!(got[3], "broadcast");
    assert_eq!(got[2], "realtime:room1");
    assert_eq!(
        got[4],
        json!({ "type": "broadcast", "event": "msg", "payload": { "text": "hi" } })
    );

    let ack = recv(&mut b).await;
    assert_eq!(ack[3], "phx_reply");
    assert_eq!(ack[1], "2");
    assert_eq!(ack[4]["status"], "ok");
    assert_silent(&mut b, QUIET).await;
}

#[tokio::test]
async fn broadcast_with_self_echoes_to_sender() {
    let server = common::spawn_default_server().await;
    let mut a = server.connect().await;
    join(&mut a, "realtime:echo", "1", json!({ "config": { "broadcast": { "self": true } } })).await;

    send(
        &mut a,
        frame(
            Some("1"),
            "2",
            "realtime:echo",
            "broadcast",
            json!({ "type": "broadcast", "event": "ping", "payload": {} }),
        ),
    )
    .await;
    let got = recv(&mut a).await;
    assert_eq!(got[3], "broadcast");
    assert_eq!(got[4]["event"], "ping");
    // No ack was requested.
    assert_silent(&mut a, QUIET).await;
}

#[tokio::test]
async fn broadcast_to_unjoined_topic_is_ignored() {
    let server = common::spawn_default_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    join(&mut a, "realtime:room1", "1", json!({})).await;

    send(
        &mut b,
        frame(
            None,
            "1",
            "realtime:room1",
            "broadcast",
            json!({ "type": "broadcast", "event": "msg", "payload": {} }),
        ),
    )
    .await;
    assert_silent(&mut a, QUIET).await;
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

fn track(join_ref: &str, msg_ref: &str, topic: &str, payload: Value) -> Value {
    frame(
        Some(join_ref),
        msg_ref,
        topic,
        "presence",
        json!({ "type": "presence", "event": "track", "payload": payload }),
    )
}

#[tokio::test]
async fn presence_tracks_two_connections_and_leaves_on_disconnect() {
    let server = common::spawn_default_server().await;
    let topic = "realtime:lobby";
    let presence = json!({ "config": { "presence": { "key": "user-1" } } });

    let mut a = server.connect().await;
    join(&mut a, topic, "1", presence.clone()).await;
    send(&mut a, track("1", "2", topic, json!({ "device": "laptop" }))).await;
    let diff = recv_event(&mut a, "presence_diff").await;
    assert_eq!(diff[4]["joins"]["user-1"]["metas"][0]["device"], "laptop");
    recv_reply(&mut a, "2").await;

    let mut b = server.connect().await;
    join(&mut b, topic, "1", presence).await;
    let state = recv_event(&mut b, "presence_state").await;
    assert_eq!(state[4]["user-1"]["metas"].as_array().unwrap().len(), 1);

    send(&mut b, track("1", "2", topic, json!({ "device": "phone" }))).await;
    let diff = recv_event(&mut a, "presence_diff").await;
    let b_ref = diff[4]["joins"]["user-1"]["metas"][0]["phx_ref"].clone();
    assert!(b_ref.is_string());
    recv_reply(&mut b, "2").await;

    let mut observer = server.connect().await;
    join(&mut observer, topic, "1", json!({})).await;
    let state = recv_event(&mut observer, "presence_state").await;
    assert_eq!(state[4]["user-1"]["metas"].as_array().unwrap().len(), 2);

    drop(b);

    let diff = recv_event(&mut a, "presence_diff").await;
    let leaves = diff[4]["leaves"]["user-1"]["metas"].as_array().unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0]["phx_ref"], b_ref);
    assert_eq!(leaves[0]["device"], "phone");
    assert_eq!(diff[4]["joins"], json!({}));

    recv_event(&mut observer, "presence_diff").await;
    join(&mut observer, topic, "2", json!({})).await;
    let state = recv_event(&mut observer, "presence_state").await;
    let metas = state[4]["user-1"]["metas"].as_array().unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0]["device"], "laptop");
}

#[tokio::test]
async fn retrack_replaces_meta_with_new_ref() {
    let server = common::spawn_default_server().await;
    let topic = "realtime:retrack";
    let mut a = server.connect().await;
    join(&mut a, topic, "1", json!({ "config": { "presence": { "key": "k" } } })).await;

    send(&mut a, track("1", "2", topic, json!({ "v": 1 }))).await;
    let first = recv_event(&mut a, "presence_diff").await;
    send(&mut a, track("1", "3", topic, json!({ "v": 2 }))).await;
    let second = recv_event(&mut a, "presence_diff").await;

    assert_ne!(
        first[4]["joins"]["k"]["metas"][0]["phx_ref"],
        second[4]["joins"]["k"]["metas"][0]["phx_ref"]
    );

    let mut observer = server.connect().await;
    join(&mut observer, topic, "1", json!({})).await;
    let state = recv_event(&mut observer, "presence_state").await;
    let metas = state[4]["k"]["metas"].as_array().unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0]["v"], 2);
}

#[tokio::test]
async fn untrack_sends_leave_diff_and_replies_ok() {
    let server = common::spawn_default_server().await;
    let topic = "realtime:untrack";

    let mut a = server.connect().await;
    join(&mut a, topic, "1", json!({ "config": { "presence": { "key": "user-1" } } })).await;
    send(&mut a, track("1", "2", topic, json!({ "device": "laptop" }))).await;
    recv_reply(&mut a, "2").await;

    let mut observer = server.connect().await;
    join(&mut observer, topic, "1", json!({})).await;
    recv_event(&mut observer, "presence_state").await;

    let untrack = frame(
        Some("1"),
        "3",
        topic,
        "presence",
        json!({ "type": "presence", "event": "untrack" }),
    );
    send(&mut a, untrack.clone()).await;

    for ws in [&mut a, &mut observer] {
        let diff = recv_event(ws, "presence_diff").await;
        assert_eq!(diff[4]["joins"], json!({}));
        let leaves = diff[4]["leaves"].as_object().unwrap();
        assert_eq!(leaves.keys().collect::<Vec<_>>(), ["user-1"]);
        assert_eq!(leaves["user-1"]["metas"][0]["device"], "laptop");
    }
    let reply = recv_reply(&mut a, "3").await;
    assert_eq!(reply[4]["status"], "ok");

    // Nothing left to untrack: still acknowledged, nobody else hears about it.
    let mut again = untrack;
    again[1] = json!("4");
    send(&mut a, again).await;
    let reply = recv_reply(&mut a, "4").await;
    assert_eq!(reply[4]["status"], "ok");
    assert_silent(&mut observer, QUIET).await;
}

// ---------------------------------------------------------------------------
// Channel lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_is_removed_after_last_subscriber_disconnects() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;
    join(&mut ws, "realtime:gc", "1", json!({})).await;

    let stats = server.stats().await;
    assert_eq!(stats["connections"], 1);
    assert_eq!(stats["channels"], 1);
    assert_eq!(
        stats["channel_details"],
        json!([{ "topic": "realtime:gc", "subscribers": 1, "presence_enabled": false }])
    );

    ws.close(None).await.unwrap();
    drop(ws);

    let stats = server.wait_for_connections(0).await;
    assert_eq!(stats["connections"], 0);
    assert_eq!(stats["channels"], 0);
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let server = common::spawn_default_server().await;
    let mut ws = server.connect().await;
    join(&mut ws, "realtime:big", "1", json!({})).await;

    let blob = "x".repeat(600 * 1024);
    let big = frame(
        Some("1"),
        "2",
        "realtime:big",
        "broadcast",
        json!({ "type": "broadcast", "event": "e", "payload": { "blob": blob } }),
    );
    // The server may reset the socket before the write completes.
    let _ = ws
        .send(tungstenite::Message::Text(big.to_string().into()))
        .await;
    expect_closed(&mut ws).await;

    let stats = server.wait_for_connections(0).await;
    assert_eq!(stats["connections"], 0);
    assert_eq!(stats["channels"], 0);
}

#[tokio::test]
async fn shutdown_closes_open_and_new_sockets() {
    let server = common::spawn_default_server().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    join(&mut a, "realtime:shutdown", "1", json!({})).await;
    join(&mut b, "realtime:shutdown", "1", json!({})).await;

    server.state.realtime.shutdown();
    expect_closed(&mut a).await;
    expect_closed(&mut b).await;

    let stats = server.wait_for_connections(0).await;
    assert_eq!(stats["connections"], 0);
    assert_eq!(stats["channels"], 0);

    let mut late = server.connect().await;
    expect_closed(&mut late).await;
}

// ---------------------------------------------------------------------------
// Postgres changes
// ---------------------------------------------------------------------------

async fn notify(server: &common::TestServer, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(server.http_url("/realtime/v1/notify"))
        .header("apikey", SERVICE_KEY)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn postgres_changes_are_filtered_by_row_level_security() {
    let store = MemoryPolicyStore::new();
    store.enable_rls("todos");
    store.add_policy("todos", Policy::select("owner can read", "user_id = auth.uid()"));
    let server = common::spawn_server(Arc::new(store)).await;

    let changes = |token: &str| {
        json!({
            "config": {
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": "todos" },
                    { "event": "*", "schema": "public", "table": "todos", "filter": "done=eq.false" }
                ]
            },
            "access_token": token
        })
    };

    let mut owner = server.connect().await;
    let reply = join(&mut owner, "realtime:todos", "1", changes(&mint_token("u1", "authenticated"))).await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(
        reply["response"]["postgres_changes"],
        json!([
            { "id": 1, "event": "INSERT", "schema": "public", "table": "todos" },
            { "id": 2, "event": "*", "schema": "public", "table": "todos", "filter": "done=eq.false" }
        ])
    );

    let mut stranger = server.connect().await;
    join(&mut stranger, "realtime:todos", "1", changes(&mint_token("u2", "authenticated"))).await;

    let resp = notify(
        &server,
        json!({
            "schema": "public",
            "table": "todos",
            "type": "INSERT",
            "record": { "id": 1, "user_id": "u1", "done": false }
        }),
    )
    .await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["delivered"], 1);

    let got = recv(&mut owner).await;
    assert_eq!(got[0], "1");
    assert_eq!(got[2], "realtime:todos");
    assert_eq!(got[3], "postgres_changes");
    assert_eq!(got[4]["ids"], json!([1, 2]));
    assert_eq!(got[4]["data"]["type"], "INSERT");
    assert_eq!(got[4]["data"]["table"], "todos");
    assert_eq!(got[4]["data"]["record"]["user_id"], "u1");
    assert!(got[4]["data"].get("old_record").is_none());
    assert!(got[4]["data"]["errors"].is_null());

    assert_silent(&mut stranger, QUIET).await;
}

#[tokio::test]
async fn service_role_subscribers_bypass_policies() {
    let store = MemoryPolicyStore::new();
    store.enable_rls("audit");
    let server = common::spawn_server(Arc::new(store)).await;

    let sub = |token: String| {
        json!({
            "config": { "postgres_changes": [{ "event": "*", "schema": "public", "table": "audit" }] },
            "access_token": token
        })
    };

    let mut admin = server.connect().await;
    join(&mut admin, "realtime:audit", "1", sub(mint_token("svc", "service_role"))).await;
    let mut user = server.connect().await;
    join(&mut user, "realtime:audit", "1", sub(mint_token("u1", "authenticated"))).await;

    let resp = notify(
        &server,
        json!({ "table": "audit", "type": "DELETE", "old_record": { "id": 9 } }),
    )
    .await;
    assert_eq!(resp.status(), 202);

    let got = recv_event(&mut admin, "postgres_changes").await;
    assert_eq!(got[4]["data"]["type"], "DELETE");
    assert_eq!(got[4]["data"]["old_record"], json!({ "id": 9 }));
    assert_silent(&mut user, QUIET).await;
}

#[tokio::test]
async fn notify_validates_body() {
    let server = common::spawn_default_server().await;

    let resp = notify(&server, json!({ "table": "todos", "type": "INSERT" })).await;
    assert_eq!(resp.status(), 400);

    let resp = notify(&server, json!({ "table": "", "type": "UPDATE", "record": {} })).await;
    assert_eq!(resp.status(), 400);

    let resp = notify(&server, json!({ "table": "todos", "type": "DELETE" })).await;
    assert_eq!(resp.status(), 400);
}
