//! # Matchmaking
//!
//! Atomic find-or-join of waiting matches within a rating window.
//!
//! All functions take an open transaction and never commit it; the
//! handler owns the transaction boundary. Row locks (`FOR UPDATE`) on the
//! match rows make sure two concurrent searches cannot both claim the same
//! waiting match, while joined user rows stay unlocked (`FOR UPDATE OF m`).

use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::PvpConfig;
use crate::error::AppResult;
use crate::models::{Match, MatchStatus};
use crate::services::task_selector;

/// Finds an opponent for `user_id` or leaves them waiting.
///
/// Resolution order:
/// 1. If the user already sits in an active match, return it unchanged
///    (supports polling after pairing). An existing waiting match is kept
///    on hand but does not stop the search.
/// 2. Claim the oldest compatible waiting match (creator rating within
///    `±rating_match_window`), locking only that row. On success the
///    user's own stale waiting match is deleted, the claimed match turns
///    active and its task set is assigned.
/// 3. Otherwise return the user's existing waiting match, or create a
///    fresh one.
#[instrument(skip(tx, config), fields(user_id = %user_id, user_rating))]
pub async fn find_or_join(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    user_rating: i32,
    config: &PvpConfig,
) -> AppResult<Match> {
    // Self-guard: lock any open match of this user first so a concurrent
    // call for the same user serializes here.
    let own: Option<Match> = sqlx::query_as::<_, Match>(
        "SELECT * FROM matches
         WHERE (player1_id = $1 OR player2_id = $1) AND status IN ('waiting', 'active')
         ORDER BY created_at ASC
         LIMIT 1
         FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let own_waiting = match own {
        Some(m) if m.status == MatchStatus::Active => {
            debug!(match_id = %m.id, "User already in an active match");
            return Ok(m);
        }
        other => other,
    };

    // Oldest compatible waiting match, FIFO. Lock only the match row.
    let candidate: Option<Match> = sqlx::query_as::<_, Match>(
        "SELECT m.* FROM matches m
         JOIN users u ON u.id = m.player1_id
         WHERE m.status = 'waiting'
           AND m.player2_id IS NULL
           AND m.player1_id <> $1
           AND u.rating BETWEEN $2 AND $3
         ORDER BY m.created_at ASC
         LIMIT 1
         FOR UPDATE OF m",
    )
    .bind(user_id)
    .bind(user_rating - config.rating_match_window)
    .bind(user_rating + config.rating_match_window)
    .fetch_optional(tx.as_mut())
    .await?;

    if let Some(candidate) = candidate {
        // Joining a better match makes the user's own waiting room stale.
        if let Some(stale) = &own_waiting {
            sqlx::query("DELETE FROM matches WHERE id = $1")
                .bind(stale.id)
                .execute(tx.as_mut())
                .await?;
            debug!(match_id = %stale.id, "Deleted user's own waiting match");
        }

        let joined: Match = sqlx::query_as::<_, Match>(
            "UPDATE matches SET player2_id = $1, status = 'active' WHERE id = $2 RETURNING *",
        )
        .bind(user_id)
        .bind(candidate.id)
        .fetch_one(tx.as_mut())
        .await?;

        task_selector::select_tasks(tx, joined.id, &config.task_quota).await?;

        info!(
            match_id = %joined.id,
            player1_id = %joined.player1_id,
            "Paired players, match is now active"
        );
        return Ok(joined);
    }

    if let Some(waiting) = own_waiting {
        debug!(match_id = %waiting.id, "No compatible opponent, keep waiting");
        return Ok(waiting);
    }

    let created: Match =
        sqlx::query_as::<_, Match>("INSERT INTO matches (player1_id) VALUES ($1) RETURNING *")
            .bind(user_id)
            .fetch_one(tx.as_mut())
            .await?;

    info!(match_id = %created.id, "Created a new waiting match");
    Ok(created)
}

/// Deletes the caller's own waiting match, if any, and returns its id.
///
/// Active and terminal matches are untouched; a waiting match that has
/// just been claimed by another player no longer qualifies (the row lock
/// serializes with the claim).
#[instrument(skip(tx), fields(user_id = %user_id))]
pub async fn cancel_waiting(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> AppResult<Option<Uuid>> {
    let own_waiting: Option<Match> = sqlx::query_as::<_, Match>(
        "SELECT * FROM matches
         WHERE player1_id = $1 AND status = 'waiting' AND player2_id IS NULL
         FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(waiting) = own_waiting else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM matches WHERE id = $1")
        .bind(waiting.id)
        .execute(tx.as_mut())
        .await?;

    info!(match_id = %waiting.id, "Cancelled waiting match");
    Ok(Some(waiting.id))
}
