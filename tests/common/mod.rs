#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use duelo::config::PvpConfig;
use duelo::models::AppState;
use duelo::services::jwt::JwtService;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn init_tracing_once() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("duelo=debug")
            .with_test_writer()
            .init();
    });
}

pub struct TestApp {
    pub address: String,
    pub state: Arc<AppState>,
}

/// Spawns the application with default configuration on a random port.
pub async fn spawn_app(test_db_pool: PgPool) -> TestApp {
    spawn_app_with_config(test_db_pool, PvpConfig::default()).await
}

/// Spawns the application with custom match runtime configuration, e.g.
/// a short disconnect timeout for grace-window tests.
pub async fn spawn_app_with_config(test_db_pool: PgPool, config: PvpConfig) -> TestApp {
    dotenvy::from_filename_override("tests/data/.test.env").unwrap();
    init_tracing_once();

    // Randomly choose an available port
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port at localhost");
    let port = listener.local_addr().unwrap().port();

    let (app, state) = duelo::app_with_config(test_db_pool, config);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    let address = format!("http://127.0.0.1:{port}");

    // Wait for server to be ready
    let client = reqwest::Client::new();
    for _ in 0..10 {
        if client
            .get(format!("{address}/health-check"))
            .send()
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    TestApp { address, state }
}

/// Mints a valid access token for the given user, signed with the test
/// secret the spawned app verifies against.
pub fn auth_token(user_id: Uuid) -> String {
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET should be set by the test env");
    JwtService::from_secret(secret.as_bytes())
        .create_access_token(user_id)
        .expect("failed to mint test token")
}

/// Inserts a user with the given rating and returns their id.
pub async fn seed_user(pool: &PgPool, username: &str, rating: i32) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO users (username, email, password_hash, rating)
         VALUES ($1, $2, 'test-hash', $3)
         RETURNING id",
    )
    .bind(username)
    .bind(format!("{username}@example.com"))
    .bind(rating)
    .fetch_one(pool)
    .await
    .expect("failed to seed user")
}

/// Seeds exactly one full quota of tasks: difficulties [1, 2, 3, 3, 4].
///
/// Each task's canonical answer is its upper-cased title, so tests can
/// produce a correct answer from the `match_start` payload (and exercise
/// case-insensitive comparison by submitting the lower-case title).
pub async fn seed_tasks(pool: &PgPool) {
    for (i, difficulty) in [1, 2, 3, 3, 4].into_iter().enumerate() {
        let title = format!("task-{i}");
        sqlx::query(
            "INSERT INTO tasks (subject, topic, difficulty, title, text, canonical_answer, hints)
             VALUES ('mathematics', 'algebra', $1, $2, $3, $4, $5)",
        )
        .bind(difficulty)
        .bind(&title)
        .bind(format!("Solve problem {i}"))
        .bind(title.to_uppercase())
        .bind(vec!["Start from the definition".to_string()])
        .execute(pool)
        .await
        .expect("failed to seed task");
    }
}

pub async fn current_rating(pool: &PgPool, user_id: Uuid) -> i32 {
    sqlx::query_scalar("SELECT rating FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("failed to read rating")
}

/// `POST /api/pvp/find` and parse the response body.
pub async fn post_find(client: &reqwest::Client, address: &str, token: &str) -> Value {
    let response = client
        .post(format!("{address}/api/pvp/find"))
        .bearer_auth(token)
        .send()
        .await
        .expect("find request failed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.expect("find response was not JSON")
}

/// Pairs two freshly seeded users and returns the active match id.
pub async fn pair_users(
    client: &reqwest::Client,
    address: &str,
    token_a: &str,
    token_b: &str,
) -> Uuid {
    let waiting = post_find(client, address, token_a).await;
    assert_eq!(waiting["status"], "waiting");

    let joined = post_find(client, address, token_b).await;
    assert_eq!(joined["status"], "active");
    assert_eq!(joined["match_id"], waiting["match_id"]);

    Uuid::try_parse(joined["match_id"].as_str().unwrap()).unwrap()
}

/// Opens the duplex match channel for a participant.
pub async fn connect_ws(address: &str, match_id: Uuid, token: &str) -> WsClient {
    let ws_base = address.replacen("http", "ws", 1);
    let url = format!("{ws_base}/api/pvp/ws/{match_id}?token={token}");
    let (ws, _) = connect_async(url).await.expect("websocket connect failed");
    ws
}

/// Reads frames until an event with the wanted `type` arrives, skipping
/// anything else (pings, unrelated notifications).
pub async fn wait_for_event(ws: &mut WsClient, event_type: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let message = ws
                .next()
                .await
                .expect("connection closed while waiting for event")
                .expect("websocket error while waiting for event");
            if let Message::Text(text) = message {
                let event: Value = serde_json::from_str(&text).expect("event was not JSON");
                if event["type"] == event_type {
                    return event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for `{event_type}` event"))
}

pub async fn send_answer(ws: &mut WsClient, task_id: &Value, answer: &str) {
    let frame = json!({
        "type": "submit_answer",
        "task_id": task_id,
        "answer": answer,
    });
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("failed to send answer");
}
