mod common;

use std::time::Duration;

use common::*;
use duelo::config::{DisconnectPolicy, PvpConfig};
use futures_util::SinkExt;
use serde_json::Value;
use sqlx::PgPool;

async fn match_status(pool: &PgPool, match_id: uuid::Uuid) -> String {
    sqlx::query_scalar("SELECT status::text FROM matches WHERE id = $1")
        .bind(match_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test]
async fn rest_forfeit_ends_the_match_with_elo(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let token_a = auth_token(alice);
    let token_b = auth_token(bob);
    let match_id = pair_users(&client, &app.address, &token_a, &token_b).await;

    let mut ws_b = connect_ws(&app.address, match_id, &token_b).await;

    let response = client
        .post(format!("{}/api/pvp/match/{match_id}/forfeit", app.address))
        .bearer_auth(&token_a)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["winner_id"], bob.to_string());
    assert_eq!(body["rating_change"], -16);

    // The connected opponent is told over the channel
    let end = wait_for_event(&mut ws_b, "match_end").await;
    assert_eq!(end["reason"], "forfeit");
    assert_eq!(end["winner_id"], bob.to_string());

    assert_eq!(current_rating(&pool, alice).await, 984);
    assert_eq!(current_rating(&pool, bob).await, 1016);
    assert_eq!(match_status(&pool, match_id).await, "finished");

    // The stored reason keeps the terminal outcome reconstructible
    let reason: Option<String> =
        sqlx::query_scalar("SELECT finish_reason::text FROM matches WHERE id = $1")
            .bind(match_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(reason.as_deref(), Some("forfeit"));

    // A second forfeit finds nothing active to end
    let response = client
        .post(format!("{}/api/pvp/match/{match_id}/forfeit", app.address))
        .bearer_auth(&token_b)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    // Deltas were applied exactly once
    assert_eq!(current_rating(&pool, alice).await, 984);
    assert_eq!(current_rating(&pool, bob).await, 1016);
}

#[sqlx::test]
async fn forfeit_requires_participation(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let outsider = seed_user(&pool, "outsider", 1000).await;
    let match_id = pair_users(&client, &app.address, &auth_token(alice), &auth_token(bob)).await;

    let response = client
        .post(format!("{}/api/pvp/match/{match_id}/forfeit", app.address))
        .bearer_auth(auth_token(outsider))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
}

#[sqlx::test]
async fn disconnect_past_grace_window_forfeits(pool: PgPool) {
    seed_tasks(&pool).await;

    let config = PvpConfig {
        disconnect_timeout: Duration::from_secs(2),
        disconnect_warning_offsets: vec![1],
        disconnect_policy: DisconnectPolicy::Forfeit,
        ..PvpConfig::default()
    };
    let app = spawn_app_with_config(pool.clone(), config).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let token_a = auth_token(alice);
    let token_b = auth_token(bob);
    let match_id = pair_users(&client, &app.address, &token_a, &token_b).await;

    let mut ws_a = connect_ws(&app.address, match_id, &token_a).await;
    let mut ws_b = connect_ws(&app.address, match_id, &token_b).await;
    wait_for_event(&mut ws_a, "match_start").await;
    wait_for_event(&mut ws_b, "match_start").await;

    ws_a.close(None).await.unwrap();
    drop(ws_a);

    let gone = wait_for_event(&mut ws_b, "opponent_disconnected").await;
    assert_eq!(gone["reconnecting"], true);
    assert_eq!(gone["timeout_seconds"], 2);

    // Progressive warning before the window runs out
    let warning = wait_for_event(&mut ws_b, "disconnect_warning").await;
    assert_eq!(warning["seconds_remaining"], 1);
    assert_eq!(warning["user_id"], alice.to_string());

    let end = wait_for_event(&mut ws_b, "match_end").await;
    assert_eq!(end["reason"], "forfeit");
    assert_eq!(end["winner_id"], bob.to_string());

    assert_eq!(current_rating(&pool, alice).await, 984);
    assert_eq!(current_rating(&pool, bob).await, 1016);
    assert_eq!(match_status(&pool, match_id).await, "finished");
}

#[sqlx::test]
async fn disconnect_past_grace_window_technical_error(pool: PgPool) {
    seed_tasks(&pool).await;

    let config = PvpConfig {
        disconnect_timeout: Duration::from_secs(1),
        disconnect_warning_offsets: vec![],
        disconnect_policy: DisconnectPolicy::TechnicalError,
        ..PvpConfig::default()
    };
    let app = spawn_app_with_config(pool.clone(), config).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let token_a = auth_token(alice);
    let token_b = auth_token(bob);
    let match_id = pair_users(&client, &app.address, &token_a, &token_b).await;

    let mut ws_a = connect_ws(&app.address, match_id, &token_a).await;
    let mut ws_b = connect_ws(&app.address, match_id, &token_b).await;
    wait_for_event(&mut ws_a, "match_start").await;
    wait_for_event(&mut ws_b, "match_start").await;

    ws_a.close(None).await.unwrap();
    drop(ws_a);

    let end = wait_for_event(&mut ws_b, "match_end").await;
    assert_eq!(end["reason"], "technical_error");
    assert!(end["winner_id"].is_null());
    assert_eq!(end["player1_rating_change"], 0);
    assert_eq!(end["player2_rating_change"], 0);

    // Ratings untouched, but the match is terminal with a finish time
    assert_eq!(current_rating(&pool, alice).await, 1000);
    assert_eq!(current_rating(&pool, bob).await, 1000);
    assert_eq!(match_status(&pool, match_id).await, "error");
    let (finish_reason, finished_at): (Option<String>, Option<time::OffsetDateTime>) =
        sqlx::query_as("SELECT finish_reason::text, finished_at FROM matches WHERE id = $1")
            .bind(match_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(finish_reason.as_deref(), Some("technical_error"));
    assert!(finished_at.is_some());
}

#[sqlx::test]
async fn waiting_creator_leaving_deletes_the_match(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let token = auth_token(alice);

    let waiting = post_find(&client, &app.address, &token).await;
    let match_id = uuid::Uuid::try_parse(waiting["match_id"].as_str().unwrap()).unwrap();

    let mut ws = connect_ws(&app.address, match_id, &token).await;
    ws.close(None).await.unwrap();
    drop(ws);

    // Give the disconnect branch a moment to run its orphan cleanup
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = client
        .get(format!("{}/api/pvp/match/{match_id}", app.address))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // No rating was touched by the cleanup
    assert_eq!(current_rating(&pool, alice).await, 1000);
}
