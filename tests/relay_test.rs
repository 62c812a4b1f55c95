// Integration tests for the relay over real WebSocket connections
// Each test runs an in-process server on an ephemeral port

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use rusty_relay::config::RelayConfig;
use rusty_relay::core::server::{RelayServer, SharedRelayServer};
use rusty_relay::handlers::routes;

const USER_SECRET: &str = "it-user-signing-secret-01";
const ADMIN_SECRET: &str = "it-admin-signing-secret-02";
const ADMIN_BE_KEY: &str = "it-admin-backend-key-03";
const USER_BE_KEY: &str = "it-user-backend-key-04";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    server: SharedRelayServer,
}

async fn start_relay(configure: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let mut config = RelayConfig::with_credentials(USER_SECRET, ADMIN_SECRET, ADMIN_BE_KEY, USER_BE_KEY);
    config.host = "127.0.0.1".to_string();
    configure(&mut config);

    let server = Arc::new(RelayServer::new(config));
    server.start_background_tasks();
    let (addr, serving) = warp::serve(routes(server.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(serving);
    TestRelay { addr, server }
}

fn token(secret: &str, user_id: &str, role: &str) -> String {
    let exp = chrono::Utc::now().timestamp() as usize + 3600;
    encode(
        &Header::default(),
        &json!({ "userId": user_id, "role": role, "exp": exp }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn connect(addr: SocketAddr) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect");
    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "CONNECTED");
    assert!(greeting["payload"]["connectionId"].is_string());
    ws
}

async fn send_json(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

// Next text frame, skipping transport-level frames
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

// Close code of the next close frame, if the server sent one
async fn expect_close(ws: &mut Ws) -> Option<u16> {
    loop {
        match timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timed out waiting for close")
        {
            Some(Ok(Message::Close(frame))) => {
                // Keep polling so the client flushes its close reply
                while let Ok(Some(Ok(_))) = timeout(Duration::from_secs(1), ws.next()).await {}
                return frame.map(|f| u16::from(f.code));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    loop {
        match timeout(Duration::from_millis(300), ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("Unexpected frame: {}", text),
            Ok(_) => continue,
        }
    }
}

async fn authenticate(ws: &mut Ws, payload: Value) -> Value {
    send_json(ws, json!({ "type": "AUTH", "payload": payload })).await;
    next_json(ws).await
}

async fn user_client(addr: SocketAddr, user_id: &str) -> Ws {
    let mut ws = connect(addr).await;
    let reply = authenticate(&mut ws, json!({ "token": token(USER_SECRET, user_id, "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_SUCCESS");
    ws
}

async fn admin_client(addr: SocketAddr, user_id: &str) -> Ws {
    let mut ws = connect(addr).await;
    let reply = authenticate(
        &mut ws,
        json!({ "token": token(ADMIN_SECRET, user_id, "ADMIN"), "clientType": "admin" }),
    )
    .await;
    assert_eq!(reply["type"], "AUTH_SUCCESS");
    ws
}

async fn service_client(addr: SocketAddr, key: &str, service_type: &str) -> Ws {
    let mut ws = connect(addr).await;
    let reply = authenticate(
        &mut ws,
        json!({ "serviceKey": key, "serviceType": service_type, "clientType": "service" }),
    )
    .await;
    assert_eq!(reply["type"], "AUTH_SUCCESS");
    ws
}

async fn wait_for_sockets(server: &SharedRelayServer, expected: usize) {
    for _ in 0..100 {
        if server.open_sockets().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    panic!(
        "Expected {} open sockets, found {}",
        expected,
        server.open_sockets().await
    );
}

#[tokio::test]
async fn test_user_auth_and_auto_subscription() {
    let relay = start_relay(|_| {}).await;
    let mut ws = connect(relay.addr).await;

    let reply = authenticate(&mut ws, json!({ "token": token(USER_SECRET, "u1", "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_SUCCESS");
    assert_eq!(reply["payload"]["userId"], "u1");
    assert_eq!(reply["payload"]["clientType"], "user");
    let subs = reply["payload"]["subscriptions"].as_array().unwrap();
    for channel in ["user:u1", "orders:u1", "notifications:u1"] {
        assert!(subs.iter().any(|s| s == channel), "missing {}", channel);
    }
    assert!(reply["timestamp"].is_string());
    assert!(reply["messageId"].is_string());

    let stats = relay.server.registry().stats().await;
    assert_eq!(stats.total_clients, 1);
    assert_eq!(stats.unique_users, 1);
}

#[tokio::test]
async fn test_invalid_credentials_leave_socket_open() {
    let relay = start_relay(|_| {}).await;
    let mut ws = connect(relay.addr).await;

    let reply = authenticate(&mut ws, json!({ "token": token("not-the-right-secret", "u1", "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_ERROR");
    assert_eq!(reply["payload"]["error"], "invalid token");

    let reply = authenticate(&mut ws, json!({ "serviceKey": "wrong", "serviceType": "admin-be" })).await;
    assert_eq!(reply["payload"]["error"], "invalid service key");

    let reply = authenticate(&mut ws, json!({})).await;
    assert_eq!(reply["payload"]["error"], "no authentication provided");

    // Still usable afterwards
    let reply = authenticate(&mut ws, json!({ "token": token(USER_SECRET, "u1", "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_SUCCESS");
}

#[tokio::test]
async fn test_per_user_cap_closes_with_policy_violation() {
    let relay = start_relay(|config| config.max_connections_per_user = 2).await;
    let _first = user_client(relay.addr, "u1").await;
    let _second = user_client(relay.addr, "u1").await;

    let mut third = connect(relay.addr).await;
    let reply = authenticate(&mut third, json!({ "token": token(USER_SECRET, "u1", "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_ERROR");
    assert_eq!(reply["payload"]["error"], "Maximum connections per user reached");
    assert_eq!(expect_close(&mut third).await, Some(1008));

    let stats = relay.server.registry().stats().await;
    assert_eq!(stats.total_clients, 2);

    // Another user is unaffected
    let _other = user_client(relay.addr, "u2").await;
    assert_eq!(relay.server.registry().client_count().await, 3);
}

#[tokio::test]
async fn test_global_cap_closes_and_default_budget_holds() {
    let relay = start_relay(|config| config.max_total_connections = 1).await;
    let mut admitted = user_client(relay.addr, "u1").await;

    let mut refused = connect(relay.addr).await;
    let reply = authenticate(&mut refused, json!({ "token": token(USER_SECRET, "u2", "CONSUMER") })).await;
    assert_eq!(reply["type"], "AUTH_ERROR");
    assert_eq!(reply["payload"]["error"], "Server at maximum capacity");
    assert_eq!(expect_close(&mut refused).await, Some(1008));
    assert_eq!(relay.server.registry().client_count().await, 1);

    // Unknown types count against the budget without a reply
    for _ in 0..99 {
        send_json(&mut admitted, json!({ "type": "NOOP" })).await;
    }
    send_json(&mut admitted, json!({ "type": "SUBSCRIBE", "payload": { "channels": ["news"] } })).await;
    assert_eq!(next_json(&mut admitted).await["type"], "SUBSCRIBE");

    send_json(&mut admitted, json!({ "type": "SUBSCRIBE", "payload": { "channels": ["more"] } })).await;
    let reply = next_json(&mut admitted).await;
    assert_eq!(reply["type"], "RATE_LIMIT_ERROR");
    assert_eq!(reply["payload"]["remaining"], 0);
    let reset_in = reply["payload"]["resetInMs"].as_u64().unwrap();
    assert!(reset_in > 0 && reset_in <= 60_000);
}

#[tokio::test]
async fn test_slot_frees_after_disconnect() {
    let relay = start_relay(|config| config.max_connections_per_user = 1).await;
    let mut first = user_client(relay.addr, "u1").await;
    first.close(None).await.unwrap();
    drop(first);
    wait_for_sockets(&relay.server, 0).await;

    let _again = user_client(relay.addr, "u1").await;
    relay.server.registry().verify_consistency().await.unwrap();
}

#[tokio::test]
async fn test_rate_limit_drops_excess_frames() {
    let relay = start_relay(|config| config.rate_limit_max_messages = 3).await;
    let mut ws = user_client(relay.addr, "u1").await;

    for i in 0..3 {
        send_json(&mut ws, json!({ "type": "SUBSCRIBE", "payload": { "channels": [format!("feed{}", i)] } })).await;
        assert_eq!(next_json(&mut ws).await["type"], "SUBSCRIBE");
    }

    send_json(&mut ws, json!({ "type": "SUBSCRIBE", "payload": { "channels": ["feed3"] } })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "RATE_LIMIT_ERROR");
    assert!(reply["payload"]["resetInMs"].as_u64().unwrap() > 0);

    // PING is exempt
    send_json(&mut ws, json!({ "type": "PING" })).await;
    assert_eq!(next_json(&mut ws).await["type"], "PONG");
}

#[tokio::test]
async fn test_batch_recall_reaches_admins_and_user_backend() {
    let relay = start_relay(|_| {}).await;
    let mut admin = admin_client(relay.addr, "a1").await;
    let mut user_be = service_client(relay.addr, USER_BE_KEY, "user-be").await;
    let mut consumer = user_client(relay.addr, "u1").await;
    let mut admin_be = service_client(relay.addr, ADMIN_BE_KEY, "admin-be").await;

    send_json(
        &mut admin_be,
        json!({ "type": "BATCH_RECALLED", "payload": { "batchId": "b-42", "reason": "contamination" } }),
    )
    .await;

    let at_admin = next_json(&mut admin).await;
    assert_eq!(at_admin["type"], "BATCH_RECALLED");
    assert_eq!(at_admin["payload"]["batchId"], "b-42");
    let at_service = next_json(&mut user_be).await;
    assert_eq!(at_service["type"], "BATCH_RECALLED");
    assert_eq!(at_service["payload"]["reason"], "contamination");

    expect_silence(&mut consumer).await;
    expect_silence(&mut admin_be).await;
}

#[tokio::test]
async fn test_order_update_reaches_owner_only() {
    let relay = start_relay(|_| {}).await;
    let mut owner = user_client(relay.addr, "u1").await;
    let mut stranger = user_client(relay.addr, "u2").await;
    let mut user_be = service_client(relay.addr, USER_BE_KEY, "user-be").await;

    send_json(
        &mut user_be,
        json!({ "type": "ORDER_CREATED", "payload": { "orderId": "o-1", "userId": "u1" } }),
    )
    .await;

    let frame = next_json(&mut owner).await;
    assert_eq!(frame["type"], "ORDER_CREATED");
    assert_eq!(frame["payload"]["orderId"], "o-1");
    expect_silence(&mut stranger).await;
}

#[tokio::test]
async fn test_user_cannot_join_foreign_channel() {
    let relay = start_relay(|_| {}).await;
    let mut ws = user_client(relay.addr, "u1").await;

    send_json(&mut ws, json!({ "type": "SUBSCRIBE", "payload": { "channels": ["orders:u2"] } })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "SUBSCRIBE");
    assert!(reply["payload"]["subscribed"].as_array().unwrap().is_empty());
    assert!(relay.server.registry().subscribers_of("orders:u2").await.is_empty());
}

#[tokio::test]
async fn test_unauthenticated_frames_rejected() {
    let relay = start_relay(|_| {}).await;
    let mut ws = connect(relay.addr).await;

    send_json(&mut ws, json!({ "type": "SUBSCRIBE", "payload": { "channels": ["news"] } })).await;
    assert_eq!(next_json(&mut ws).await["payload"]["error"], "authentication required");

    send_json(&mut ws, json!({ "type": "BROADCAST", "payload": { "message": "hi" } })).await;
    assert_eq!(next_json(&mut ws).await["type"], "AUTH_ERROR");

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["payload"]["error"], "Invalid message format");

    send_json(&mut ws, json!({ "type": "PING" })).await;
    assert_eq!(next_json(&mut ws).await["type"], "PONG");
}

#[tokio::test]
async fn test_heartbeat_terminates_unresponsive_client() {
    let relay = start_relay(|config| config.heartbeat_interval = Duration::from_millis(150)).await;

    // Never polled again, so it never answers pings
    let _silent = connect(relay.addr).await;

    // Keeps reading, which lets the client answer pings
    let mut lively = connect(relay.addr).await;
    let reader = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
        while tokio::time::Instant::now() < deadline {
            send_json(&mut lively, json!({ "type": "PING" })).await;
            let _ = timeout(Duration::from_millis(50), lively.next()).await;
        }
        lively
    });

    wait_for_sockets(&relay.server, 1).await;
    let _lively = reader.await.unwrap();
    assert_eq!(relay.server.open_sockets().await, 1);
}

#[tokio::test]
async fn test_graceful_shutdown_notifies_clients() {
    let relay = start_relay(|_| {}).await;
    let mut user = user_client(relay.addr, "u1").await;
    let mut pending = connect(relay.addr).await;

    let server = relay.server.clone();
    let shutdown = tokio::spawn(async move { server.shutdown().await });

    for ws in [&mut user, &mut pending] {
        let notice = next_json(ws).await;
        assert_eq!(notice["type"], "SERVER_SHUTDOWN");
        assert_eq!(expect_close(ws).await, Some(1001));
    }

    timeout(Duration::from_secs(6), shutdown).await.unwrap().unwrap();
    assert_eq!(relay.server.open_sockets().await, 0);
    assert_eq!(relay.server.registry().client_count().await, 0);

    // Late arrivals are turned away
    let (mut late, _) = connect_async(format!("ws://{}/ws", relay.addr)).await.unwrap();
    assert_eq!(expect_close(&mut late).await, Some(1001));
}
