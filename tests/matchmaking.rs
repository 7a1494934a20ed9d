mod common;

use common::*;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[sqlx::test]
async fn find_creates_a_waiting_match(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let token = auth_token(alice);

    let body = post_find(&client, &app.address, &token).await;
    assert_eq!(body["status"], "waiting");
    assert!(body.get("opponent").is_none());

    // Polling again returns the same waiting match
    let again = post_find(&client, &app.address, &token).await;
    assert_eq!(again["match_id"], body["match_id"]);
    assert_eq!(again["status"], "waiting");
}

#[sqlx::test]
async fn find_requires_authentication(pool: PgPool) {
    let app = spawn_app(pool).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/pvp/find", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .post(format!("{}/api/pvp/find", app.address))
        .bearer_auth("not-a-real-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn pairs_players_within_rating_window(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1100).await;
    let token_a = auth_token(alice);
    let token_b = auth_token(bob);

    let waiting = post_find(&client, &app.address, &token_a).await;
    let joined = post_find(&client, &app.address, &token_b).await;

    assert_eq!(joined["match_id"], waiting["match_id"]);
    assert_eq!(joined["status"], "active");
    assert_eq!(joined["opponent"]["id"], alice.to_string());
    assert_eq!(joined["opponent"]["username"], "alice");

    // Polling by the creator now reports the active match with the joiner
    let polled = post_find(&client, &app.address, &token_a).await;
    assert_eq!(polled["status"], "active");
    assert_eq!(polled["opponent"]["id"], bob.to_string());
}

#[sqlx::test]
async fn pairing_assigns_the_ordered_task_set(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let match_id = pair_users(&client, &app.address, &auth_token(alice), &auth_token(bob)).await;

    let response = client
        .get(format!("{}/api/pvp/match/{match_id}", app.address))
        .bearer_auth(auth_token(bob))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let detail: Value = response.json().await.unwrap();

    let tasks = detail["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 5);
    let orders: Vec<i64> = tasks.iter().map(|t| t["order"].as_i64().unwrap()).collect();
    assert_eq!(orders, vec![1, 2, 3, 4, 5]);
    // Easy bucket first, hard bucket last
    assert!(tasks[0]["difficulty"].as_i64().unwrap() <= 2);
    assert_eq!(tasks[4]["difficulty"], 4);
    // Canonical answers stay on the server
    assert!(response_has_no_answer_keys(&detail));
}

fn response_has_no_answer_keys(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .all(|(k, v)| !k.contains("answer") && response_has_no_answer_keys(v)),
        Value::Array(items) => items.iter().all(response_has_no_answer_keys),
        _ => true,
    }
}

#[sqlx::test]
async fn rating_window_excludes_distant_players(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1500).await;

    let waiting_a = post_find(&client, &app.address, &auth_token(alice)).await;
    let waiting_b = post_find(&client, &app.address, &auth_token(bob)).await;

    assert_eq!(waiting_b["status"], "waiting");
    assert_ne!(waiting_b["match_id"], waiting_a["match_id"]);
}

#[sqlx::test]
async fn joining_prefers_the_oldest_compatible_match(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    // Two waiting creators far enough apart to not match each other
    let early = seed_user(&pool, "early", 1150).await;
    let late = seed_user(&pool, "late", 1450).await;
    let joiner = seed_user(&pool, "joiner", 1300).await;

    post_find(&client, &app.address, &auth_token(early)).await;
    post_find(&client, &app.address, &auth_token(late)).await;

    // Both creators are in the joiner's window; FIFO picks the older one
    let joined = post_find(&client, &app.address, &auth_token(joiner)).await;
    assert_eq!(joined["status"], "active");
    assert_eq!(joined["opponent"]["id"], early.to_string());
}

#[sqlx::test]
async fn joining_deletes_own_stale_waiting_match(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;

    // Bob's waiting match predates alice's own
    let bob_match: Uuid = sqlx::query_scalar(
        "INSERT INTO matches (player1_id, created_at) VALUES ($1, now() - interval '1 minute')
         RETURNING id",
    )
    .bind(bob)
    .fetch_one(&pool)
    .await
    .unwrap();
    let alice_match: Uuid =
        sqlx::query_scalar("INSERT INTO matches (player1_id) VALUES ($1) RETURNING id")
            .bind(alice)
            .fetch_one(&pool)
            .await
            .unwrap();

    // Alice's poll joins the older compatible match and her own waiting
    // room disappears
    let joined = post_find(&client, &app.address, &auth_token(alice)).await;
    assert_eq!(joined["status"], "active");
    assert_eq!(joined["match_id"], bob_match.to_string());

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM matches WHERE id = $1")
        .bind(alice_match)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[sqlx::test]
async fn cancel_removes_only_own_waiting_match(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let token = auth_token(alice);
    let waiting = post_find(&client, &app.address, &token).await;

    let response = client
        .delete(format!("{}/api/pvp/find", app.address))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    // Nothing left to cancel
    let response = client
        .delete(format!("{}/api/pvp/find", app.address))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cancelled"], false);

    // The cancelled match is gone
    let match_id = waiting["match_id"].as_str().unwrap();
    let response = client
        .get(format!("{}/api/pvp/match/{match_id}", app.address))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[sqlx::test]
async fn match_detail_is_participant_only(pool: PgPool) {
    seed_tasks(&pool).await;
    let app = spawn_app(pool.clone()).await;
    let client = reqwest::Client::new();

    let alice = seed_user(&pool, "alice", 1000).await;
    let bob = seed_user(&pool, "bob", 1000).await;
    let outsider = seed_user(&pool, "outsider", 1000).await;
    let match_id = pair_users(&client, &app.address, &auth_token(alice), &auth_token(bob)).await;

    let response = client
        .get(format!("{}/api/pvp/match/{match_id}", app.address))
        .bearer_auth(auth_token(outsider))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = client
        .get(format!("{}/api/pvp/match/{}", app.address, Uuid::new_v4()))
        .bearer_auth(auth_token(alice))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
