//! # Match State Transitions
//!
//! Answer processing, completion detection and the idempotent terminal
//! transition. Every mutating operation row-locks the match first, so
//! concurrent submissions and racing finalization triggers serialize on
//! the single match row.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PvpConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Match, MatchStatus};
use crate::services::elo;

/// Why a match reached its terminal state. Persisted on the match row so
/// a re-finalization reproduces the original outcome verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "match_finish_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// Both players answered every task.
    Completion,
    /// One player became unreachable past the grace window, or resigned.
    Forfeit,
    /// Unrecoverable state (e.g. both players gone); no rating changes.
    TechnicalError,
}

/// Everything the terminal `match_end` event needs, plus bookkeeping for
/// the caller.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub reason: FinalizeReason,
    pub winner_id: Option<Uuid>,
    pub player1_id: Uuid,
    pub player2_id: Uuid,
    pub player1_rating_change: i32,
    pub player1_new_rating: i32,
    pub player2_rating_change: i32,
    pub player2_new_rating: i32,
    pub player1_score: i32,
    pub player2_score: i32,
    /// True when the match was already terminal and this outcome was
    /// reconstructed from stored columns. Callers must not emit another
    /// `match_end` in that case.
    pub was_already_terminal: bool,
}

impl MatchOutcome {
    /// The rating delta of one participant, by id.
    pub fn rating_change_of(&self, user_id: Uuid) -> i32 {
        if user_id == self.player1_id {
            self.player1_rating_change
        } else {
            self.player2_rating_change
        }
    }
}

/// Lowercases and trims an answer for comparison. Judging is plain string
/// equality; no numeric tolerance, no multi-solution support.
pub fn normalize_answer(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Processes one answer submission.
///
/// Validates that the match accepts answers, that the submitter is a
/// participant and that the task belongs to the match's own task set (not
/// merely to the catalog), then upserts the answer on its unique key and
/// recomputes the player's score as a COUNT over correct answers. The
/// transaction commits before any event is emitted, so a retry after a
/// downstream failure observes consistent state.
#[instrument(skip(pool, answer), fields(match_id = %match_id, user_id = %user_id, task_id = %task_id))]
pub async fn submit_answer(
    pool: &PgPool,
    match_id: Uuid,
    user_id: Uuid,
    task_id: Uuid,
    answer: &str,
) -> AppResult<(bool, i32)> {
    let mut tx = pool.begin().await?;

    // Single-row lock; side tables stay out of the lock scope.
    let m: Option<Match> = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1 FOR UPDATE")
        .bind(match_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let m = m.ok_or(AppError::NotFound("match not found"))?;

    if m.status.is_terminal() {
        return Err(AppError::InvalidState("match is no longer accepting answers"));
    }
    if !m.is_participant(user_id) {
        return Err(AppError::Forbidden("user is not a participant of this match"));
    }

    let canonical: Option<String> = sqlx::query_scalar(
        "SELECT t.canonical_answer
         FROM match_tasks mt
         JOIN tasks t ON t.id = mt.task_id
         WHERE mt.match_id = $1 AND mt.task_id = $2",
    )
    .bind(match_id)
    .bind(task_id)
    .fetch_optional(tx.as_mut())
    .await?;
    let canonical = canonical.ok_or(AppError::BadRequest("task does not belong to this match"))?;

    let is_correct = normalize_answer(answer) == normalize_answer(&canonical);

    sqlx::query(
        "INSERT INTO match_answers (match_id, user_id, task_id, answer_text, is_correct)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (match_id, user_id, task_id)
         DO UPDATE SET
            answer_text = EXCLUDED.answer_text,
            is_correct = EXCLUDED.is_correct,
            submitted_at = now()",
    )
    .bind(match_id)
    .bind(user_id)
    .bind(task_id)
    .bind(answer)
    .bind(is_correct)
    .execute(tx.as_mut())
    .await?;

    // Recompute rather than increment, so answer upserts self-correct.
    let new_score: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM match_answers
         WHERE match_id = $1 AND user_id = $2 AND is_correct",
    )
    .bind(match_id)
    .bind(user_id)
    .fetch_one(tx.as_mut())
    .await?;
    let new_score = new_score as i32;

    let score_update = if user_id == m.player1_id {
        "UPDATE matches SET player1_score = $1 WHERE id = $2"
    } else {
        "UPDATE matches SET player2_score = $1 WHERE id = $2"
    };
    sqlx::query(score_update)
        .bind(new_score)
        .bind(match_id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;

    debug!(is_correct, new_score, "Answer processed");
    Ok((is_correct, new_score))
}

/// True once both participants have submitted at least one answer for
/// every task of the match.
#[instrument(skip(pool), fields(match_id = %match_id))]
pub async fn check_match_completion(pool: &PgPool, match_id: Uuid) -> AppResult<bool> {
    let Some(m) = Match::fetch(pool, match_id).await? else {
        return Ok(false);
    };
    let Some(player2_id) = m.player2_id else {
        return Ok(false);
    };

    let total_tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM match_tasks WHERE match_id = $1")
        .bind(match_id)
        .fetch_one(pool)
        .await?;
    if total_tasks == 0 {
        return Ok(false);
    }

    let answered = |user_id: Uuid| {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM match_answers WHERE match_id = $1 AND user_id = $2",
        )
        .bind(match_id)
        .bind(user_id)
        .fetch_one(pool)
    };

    let player1_answered = answered(m.player1_id).await?;
    let player2_answered = answered(player2_id).await?;

    let complete = player1_answered >= total_tasks && player2_answered >= total_tasks;
    debug!(
        player1_answered,
        player2_answered, total_tasks, complete, "Completion check"
    );
    Ok(complete)
}

/// Full per-player state of a match, used for the reconnection sync.
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub player1_id: Uuid,
    pub player2_id: Option<Uuid>,
    pub player1_score: i32,
    pub player2_score: i32,
    pub player1_solved_tasks: Vec<Uuid>,
    pub player2_solved_tasks: Vec<Uuid>,
    pub total_tasks: u32,
    pub time_elapsed: i64,
}

/// Reads the scores, solved-task sets and elapsed time of a match.
#[instrument(skip(pool), fields(match_id = %match_id))]
pub async fn match_snapshot(pool: &PgPool, match_id: Uuid) -> AppResult<MatchSnapshot> {
    let m = Match::fetch(pool, match_id)
        .await?
        .ok_or(AppError::NotFound("match not found"))?;

    let total_tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM match_tasks WHERE match_id = $1")
        .bind(match_id)
        .fetch_one(pool)
        .await?;

    let solved = |user_id: Uuid| {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT task_id FROM match_answers
             WHERE match_id = $1 AND user_id = $2 AND is_correct",
        )
        .bind(match_id)
        .bind(user_id)
        .fetch_all(pool)
    };

    let player1_solved_tasks = solved(m.player1_id).await?;
    let player2_solved_tasks = match m.player2_id {
        Some(p2) => solved(p2).await?,
        None => Vec::new(),
    };

    let time_elapsed = (OffsetDateTime::now_utc() - m.created_at).whole_seconds();

    Ok(MatchSnapshot {
        player1_id: m.player1_id,
        player2_id: m.player2_id,
        player1_score: m.player1_score,
        player2_score: m.player2_score,
        player1_solved_tasks,
        player2_solved_tasks,
        total_tasks: total_tasks as u32,
        time_elapsed,
    })
}

/// Promotes a waiting match to active under a row lock. Idempotent: an
/// already-active match is returned unchanged. Returns whether the call
/// performed the transition.
#[instrument(skip(pool), fields(match_id = %match_id))]
pub async fn activate_match(pool: &PgPool, match_id: Uuid) -> AppResult<(bool, Match)> {
    let mut tx = pool.begin().await?;

    let m: Option<Match> = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1 FOR UPDATE")
        .bind(match_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let m = m.ok_or(AppError::NotFound("match not found"))?;

    if m.status != MatchStatus::Waiting {
        tx.commit().await?;
        return Ok((false, m));
    }

    let updated: Match = sqlx::query_as::<_, Match>(
        "UPDATE matches SET status = 'active' WHERE id = $1 RETURNING *",
    )
    .bind(match_id)
    .fetch_one(tx.as_mut())
    .await?;
    tx.commit().await?;

    info!("Match activated (waiting -> active)");
    Ok((true, updated))
}

/// Deletes an abandoned waiting match: the creator left before anyone
/// joined. Only fires while the row is still waiting with no second
/// player. Returns whether a row was removed.
#[instrument(skip(pool), fields(match_id = %match_id, user_id = %user_id))]
pub async fn cleanup_orphaned_waiting(
    pool: &PgPool,
    match_id: Uuid,
    user_id: Uuid,
) -> AppResult<bool> {
    let deleted = sqlx::query(
        "DELETE FROM matches
         WHERE id = $1 AND player1_id = $2 AND status = 'waiting' AND player2_id IS NULL",
    )
    .bind(match_id)
    .bind(user_id)
    .execute(pool)
    .await?
    .rows_affected();

    if deleted > 0 {
        info!("Removed orphaned waiting match");
    }
    Ok(deleted > 0)
}

/// Finalizes a match exactly once.
///
/// Idempotent: a match that is already finished or errored yields the
/// outcome reconstructed from its stored columns, with
/// `was_already_terminal` set and no rating re-application. A match that
/// is neither terminal nor active cannot be finalized.
///
/// For `Forfeit`, `forfeiting_user_id` names the loser; the survivor
/// wins. For `TechnicalError` the match ends without a winner and with
/// zero deltas. Rating updates respect the configured floor and happen in
/// the same transaction as the status transition.
#[instrument(skip(pool, config), fields(match_id = %match_id, reason = ?reason))]
pub async fn finalize_match(
    pool: &PgPool,
    match_id: Uuid,
    reason: FinalizeReason,
    forfeiting_user_id: Option<Uuid>,
    config: &PvpConfig,
) -> AppResult<MatchOutcome> {
    let mut tx = pool.begin().await?;

    let m: Option<Match> = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1 FOR UPDATE")
        .bind(match_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let m = m.ok_or(AppError::NotFound("match not found"))?;

    if matches!(m.status, MatchStatus::Finished | MatchStatus::Error) {
        let outcome = cached_outcome(&mut tx, &m).await?;
        tx.commit().await?;
        info!("Match already terminal, returning stored outcome");
        return Ok(outcome);
    }

    if m.status != MatchStatus::Active {
        return Err(AppError::InvalidState("only active matches can be finalized"));
    }
    let player2_id = m
        .player2_id
        .ok_or(AppError::InvalidState("active match has no second player"))?;

    let (final_status, winner_id, player1_change, player2_change) = match reason {
        FinalizeReason::TechnicalError => {
            warn!("Finalizing as technical error, ratings unchanged");
            (MatchStatus::Error, None, 0, 0)
        }
        FinalizeReason::Forfeit => {
            let forfeiter = forfeiting_user_id
                .ok_or(AppError::BadRequest("forfeit requires the forfeiting user"))?;
            let winner = m
                .opponent_id(forfeiter)
                .ok_or(AppError::BadRequest("forfeiting user is not a participant"))?;

            let (r1, r2) = load_ratings(&mut tx, m.player1_id, player2_id).await?;
            let (d1, d2) = elo::match_rating_changes(
                r1,
                r2,
                Some(winner),
                m.player1_id,
                player2_id,
                config.k_factor,
            )?;
            (MatchStatus::Finished, Some(winner), d1, d2)
        }
        FinalizeReason::Completion => {
            let winner_id = if m.player1_score > m.player2_score {
                Some(m.player1_id)
            } else if m.player2_score > m.player1_score {
                Some(player2_id)
            } else {
                None
            };

            let (r1, r2) = load_ratings(&mut tx, m.player1_id, player2_id).await?;
            let (d1, d2) = elo::match_rating_changes(
                r1,
                r2,
                winner_id,
                m.player1_id,
                player2_id,
                config.k_factor,
            )?;
            (MatchStatus::Finished, winner_id, d1, d2)
        }
    };

    sqlx::query(
        "UPDATE matches
         SET status = $1, winner_id = $2, player1_rating_change = $3,
             player2_rating_change = $4, finish_reason = $5, finished_at = now()
         WHERE id = $6",
    )
    .bind(final_status)
    .bind(winner_id)
    .bind(player1_change)
    .bind(player2_change)
    .bind(reason)
    .bind(match_id)
    .execute(tx.as_mut())
    .await?;

    let (player1_new_rating, player2_new_rating) = if final_status == MatchStatus::Error {
        load_ratings(&mut tx, m.player1_id, player2_id).await?
    } else {
        let (r1, r2) = load_ratings(&mut tx, m.player1_id, player2_id).await?;
        let new1 = elo::apply_rating_floor(r1 + player1_change, config.min_rating);
        let new2 = elo::apply_rating_floor(r2 + player2_change, config.min_rating);

        sqlx::query("UPDATE users SET rating = $1 WHERE id = $2")
            .bind(new1)
            .bind(m.player1_id)
            .execute(tx.as_mut())
            .await?;
        sqlx::query("UPDATE users SET rating = $1 WHERE id = $2")
            .bind(new2)
            .bind(player2_id)
            .execute(tx.as_mut())
            .await?;
        (new1, new2)
    };

    tx.commit().await?;

    info!(
        ?winner_id,
        player1_change, player2_change, "Match finalized"
    );

    Ok(MatchOutcome {
        reason,
        winner_id,
        player1_id: m.player1_id,
        player2_id,
        player1_rating_change: player1_change,
        player1_new_rating,
        player2_rating_change: player2_change,
        player2_new_rating,
        player1_score: m.player1_score,
        player2_score: m.player2_score,
        was_already_terminal: false,
    })
}

async fn load_ratings(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    player1_id: Uuid,
    player2_id: Uuid,
) -> AppResult<(i32, i32)> {
    let r1: i32 = sqlx::query_scalar("SELECT rating FROM users WHERE id = $1")
        .bind(player1_id)
        .fetch_one(tx.as_mut())
        .await?;
    let r2: i32 = sqlx::query_scalar("SELECT rating FROM users WHERE id = $1")
        .bind(player2_id)
        .fetch_one(tx.as_mut())
        .await?;
    Ok((r1, r2))
}

/// Rebuilds the outcome of an already-terminal match from stored columns.
async fn cached_outcome(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    m: &Match,
) -> AppResult<MatchOutcome> {
    let player2_id = m
        .player2_id
        .ok_or(AppError::InvalidState("terminal match has no second player"))?;
    let (r1, r2) = load_ratings(tx, m.player1_id, player2_id).await?;

    // Rows predating the finish_reason column fall back to the status
    let reason = m.finish_reason.unwrap_or(if m.status == MatchStatus::Error {
        FinalizeReason::TechnicalError
    } else {
        FinalizeReason::Completion
    });

    Ok(MatchOutcome {
        reason,
        winner_id: m.winner_id,
        player1_id: m.player1_id,
        player2_id,
        player1_rating_change: m.player1_rating_change.unwrap_or(0),
        player1_new_rating: r1,
        player2_rating_change: m.player2_rating_change.unwrap_or(0),
        player2_new_rating: r2,
        player1_score: m.player1_score,
        player2_score: m.player2_score,
        was_already_terminal: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_answer("  42 "), "42");
        assert_eq!(normalize_answer("X=Y"), "x=y");
        assert_eq!(normalize_answer("\tAnswer\n"), "answer");
        assert_eq!(normalize_answer("ПОБЕДА"), "победа");
    }

    #[test]
    fn reasons_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&FinalizeReason::TechnicalError).unwrap(),
            "\"technical_error\""
        );
        assert_eq!(
            serde_json::to_string(&FinalizeReason::Completion).unwrap(),
            "\"completion\""
        );
        assert_eq!(
            serde_json::to_string(&FinalizeReason::Forfeit).unwrap(),
            "\"forfeit\""
        );
    }
}
