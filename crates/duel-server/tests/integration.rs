use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use duel_core::topic::topic_by_name;
use duel_server::collab::{PlayerSnapshot, ProfileStore};
use duel_server::config::{MatchTiming, ServerConfig};
use duel_server::memory::InMemoryBackend;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// Spin up a test server on a random port, return the base URL and the
/// in-memory backend behind it.
async fn start_server() -> (String, InMemoryBackend) {
    let backend = InMemoryBackend::sample();
    for id in 1..=4 {
        backend.profiles.insert(PlayerSnapshot {
            id,
            username: format!("player{id}"),
            external_handle: Some(format!("lc_{id}")),
            rating: 1500,
            topics: vec![topic_by_name("Array").unwrap()],
            difficulty_levels: vec![1],
            repeat_allowed: true,
        });
    }

    let config = ServerConfig {
        sweep_interval: Duration::from_millis(50),
        timing: MatchTiming {
            countdown_ticks: 2,
            tick: Duration::from_millis(30),
            starting: Duration::from_millis(30),
            ..MatchTiming::default()
        },
        ..ServerConfig::default()
    };
    let (app, _state) = duel_server::build_app(&config, backend.collaborators());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{}", port), backend)
}

/// Connect a WebSocket client as `player_id`, return the split stream.
async fn ws_connect(base: &str, player_id: i64) -> (WsSink, WsSource) {
    let ws_url = base.replace("http://", "ws://");
    let url = format!("{}/ws?player_id={}", ws_url, player_id);
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream.split()
}

/// Send a JSON message over the WebSocket.
async fn ws_send(sink: &mut WsSink, msg: serde_json::Value) {
    sink.send(Message::Text(msg.to_string().into()))
        .await
        .unwrap();
}

/// Receive messages until we get one matching the expected type.
async fn ws_recv_type(stream: &mut WsSource, msg_type: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        if remaining.is_zero() {
            panic!("Timed out waiting for message type: {}", msg_type);
        }
        let msg = tokio::time::timeout(remaining, stream.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {}", msg_type))
            .unwrap()
            .unwrap();

        if let Message::Text(text) = msg {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            if parsed["type"].as_str() == Some(msg_type) {
                return parsed;
            }
        }
    }
}

/// Wait for the clock to reach the active phase.
async fn ws_recv_active(stream: &mut WsSource) -> serde_json::Value {
    loop {
        let update = ws_recv_type(stream, "timer_update").await;
        if update["phase"] == "active" {
            return update;
        }
    }
}

/// Queue players 1 and 2; return their match id and assigned problem slug.
async fn start_duel(
    sink1: &mut WsSink,
    stream1: &mut WsSource,
    sink2: &mut WsSink,
    stream2: &mut WsSource,
) -> (String, String) {
    ws_send(sink1, json!({"type": "join_queue"})).await;
    let joined = ws_recv_type(stream1, "queue_joined").await;
    assert_eq!(joined["status"], "queued");

    ws_send(sink2, json!({"type": "join_queue"})).await;
    let joined = ws_recv_type(stream2, "queue_joined").await;
    assert_eq!(joined["status"], "matched");

    let found1 = ws_recv_type(stream1, "match_found").await;
    let found2 = ws_recv_type(stream2, "match_found").await;
    assert_eq!(found1["match_id"], found2["match_id"]);
    assert_eq!(found1["opponent"]["username"], "player2");
    assert_eq!(found2["opponent"]["username"], "player1");
    assert_eq!(found1["opponent"]["rating"], 1500);

    (
        found1["match_id"].as_str().unwrap().to_string(),
        found1["problem"]["slug"].as_str().unwrap().to_string(),
    )
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let (base, _) = start_server().await;
    let resp = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(resp, "ok");
}

#[tokio::test]
async fn test_duel_decided_by_submission() {
    let (base, backend) = start_server().await;
    let (mut sink1, mut stream1) = ws_connect(&base, 1).await;
    let (mut sink2, mut stream2) = ws_connect(&base, 2).await;

    let (match_id, slug) = start_duel(&mut sink1, &mut stream1, &mut sink2, &mut stream2).await;

    let active = ws_recv_active(&mut stream2).await;
    assert!(active["start_timestamp"].as_i64().is_some());
    ws_recv_active(&mut stream1).await;

    backend.oracle.record_solve("lc_2", &slug, Utc::now());
    ws_send(&mut sink2, json!({"type": "submit_solution", "match_id": match_id})).await;

    let won = ws_recv_type(&mut stream2, "match_completed").await;
    assert_eq!(won["result"], "won");
    assert_eq!(won["reason"], "submission");
    assert_eq!(won["rating_delta"], 16);
    assert_eq!(won["new_rating"], 1516);

    let lost = ws_recv_type(&mut stream1, "match_completed").await;
    assert_eq!(lost["result"], "lost");
    assert_eq!(lost["rating_delta"], -16);
    assert_eq!(lost["opponent_rating_delta"], 16);

    let stored: serde_json::Value = reqwest::get(format!("{}/matches/{}", base, match_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["winner_id"], 2);
    assert_eq!(stored["outcome"], "submission");
    assert_eq!(stored["rating_formula"], "elo-k32-v1");

    // A late resign is rejected without a second result.
    ws_send(&mut sink1, json!({"type": "resign_match", "match_id": match_id})).await;
    let err = ws_recv_type(&mut stream1, "error").await;
    assert_eq!(err["kind"], "already_resolved");
    assert_eq!(backend.results.all().len(), 1);
}

#[tokio::test]
async fn test_submit_without_solve_is_stale() {
    let (base, _backend) = start_server().await;
    let (mut sink1, mut stream1) = ws_connect(&base, 1).await;
    let (mut sink2, mut stream2) = ws_connect(&base, 2).await;

    let (match_id, _) = start_duel(&mut sink1, &mut stream1, &mut sink2, &mut stream2).await;
    ws_recv_active(&mut stream1).await;

    ws_send(&mut sink1, json!({"type": "submit_solution", "match_id": match_id})).await;
    let err = ws_recv_type(&mut stream1, "error").await;
    assert_eq!(err["kind"], "stale_submission");
    assert_eq!(err["retry_after_ms"], 5000);
}

#[tokio::test]
async fn test_resign_gives_opponent_the_win() {
    let (base, _backend) = start_server().await;
    let (mut sink1, mut stream1) = ws_connect(&base, 1).await;
    let (mut sink2, mut stream2) = ws_connect(&base, 2).await;

    let (match_id, _) = start_duel(&mut sink1, &mut stream1, &mut sink2, &mut stream2).await;

    ws_send(&mut sink1, json!({"type": "resign_match", "match_id": match_id})).await;
    let p1 = ws_recv_type(&mut stream1, "match_completed").await;
    let p2 = ws_recv_type(&mut stream2, "match_completed").await;
    assert_eq!(p1["result"], "lost");
    assert_eq!(p1["reason"], "resignation");
    assert_eq!(p2["result"], "won");
}

#[tokio::test]
async fn test_duplicate_join_and_leave() {
    let (base, _backend) = start_server().await;
    let (mut sink, mut stream) = ws_connect(&base, 3).await;

    ws_send(&mut sink, json!({"type": "join_queue"})).await;
    ws_recv_type(&mut stream, "queue_joined").await;

    ws_send(&mut sink, json!({"type": "join_queue"})).await;
    let err = ws_recv_type(&mut stream, "error").await;
    assert_eq!(err["kind"], "already_queued");

    ws_send(&mut sink, json!({"type": "leave_queue"})).await;
    ws_recv_type(&mut stream, "queue_left").await;
    ws_send(&mut sink, json!({"type": "leave_queue"})).await;
    ws_recv_type(&mut stream, "queue_left").await;
}

#[tokio::test]
async fn test_malformed_message_keeps_connection() {
    let (base, _backend) = start_server().await;
    let (mut sink, mut stream) = ws_connect(&base, 1).await;

    ws_send(&mut sink, json!({"type": "submit_solution"})).await;
    let err = ws_recv_type(&mut stream, "error").await;
    assert_eq!(err["kind"], "malformed");

    sink.send(Message::Text("not json".into())).await.unwrap();
    let err = ws_recv_type(&mut stream, "error").await;
    assert_eq!(err["kind"], "malformed");

    ws_send(&mut sink, json!({"type": "ping"})).await;
    ws_recv_type(&mut stream, "pong").await;
}

#[tokio::test]
async fn test_disconnect_notifies_opponent() {
    let (base, _backend) = start_server().await;
    let (mut sink1, mut stream1) = ws_connect(&base, 1).await;
    let (mut sink2, mut stream2) = ws_connect(&base, 2).await;

    let (match_id, _) = start_duel(&mut sink1, &mut stream1, &mut sink2, &mut stream2).await;

    sink1.close().await.unwrap();
    drop(stream1);
    ws_recv_type(&mut stream2, "opponent_disconnected").await;

    let (_sink1, mut stream1) = ws_connect(&base, 1).await;
    let found = ws_recv_type(&mut stream1, "match_found").await;
    assert_eq!(found["match_id"].as_str().unwrap(), match_id);
    ws_recv_type(&mut stream1, "timer_update").await;
    ws_recv_type(&mut stream2, "opponent_reconnected").await;
}

#[tokio::test]
async fn test_dev_mode_creates_unknown_player() {
    let (base, backend) = start_server().await;
    let (mut sink, mut stream) = ws_connect(&base, 77).await;

    ws_send(&mut sink, json!({"type": "ping"})).await;
    ws_recv_type(&mut stream, "pong").await;

    let player = backend.profiles.player(77).await.unwrap().unwrap();
    assert_eq!(player.username, "dev_player_77");
    assert_eq!(player.rating, 1200);
    assert!(player.topics.contains(&topic_by_name("Array").unwrap()));
    assert!(!player.topics.contains(&topic_by_name("Shell").unwrap()));
}

#[tokio::test]
async fn test_settings_validation() {
    let (base, _backend) = start_server().await;
    let client = reqwest::Client::new();

    let verdict: serde_json::Value = client
        .post(format!("{}/settings/validate", base))
        .json(&json!({"topics": [], "difficulty": [1]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verdict["level"], "hard");
    assert_eq!(verdict["message"], "Select at least one topic.");

    let array = topic_by_name("Array").unwrap().0;
    let shell = topic_by_name("Shell").unwrap().0;
    let verdict: serde_json::Value = client
        .post(format!("{}/settings/validate", base))
        .json(&json!({"topics": [array, shell], "difficulty": [1, 2]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verdict["level"], "soft");
    assert_eq!(verdict["can_join"], true);
    assert_eq!(verdict["disallowed_topics"], json!([shell]));
}

#[tokio::test]
async fn test_rating_preview_and_missing_match() {
    let (base, _backend) = start_server().await;

    let preview: serde_json::Value =
        reqwest::get(format!("{}/rating/preview?player=1400&opponent=1600", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(preview["on_win"], 24);
    assert_eq!(preview["on_loss"], -8);

    let resp = reqwest::get(format!(
        "{}/matches/00000000-0000-0000-0000-000000000000",
        base
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}
