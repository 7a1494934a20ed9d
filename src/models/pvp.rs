use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::user::PlayerInfo;
use crate::services::match_logic::FinalizeReason;

/// Lifecycle states of a match. `Finished`, `Cancelled` and `Error` are
/// terminal; no transition leads out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "match_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Waiting,
    Active,
    Finished,
    Cancelled,
    Error,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Error)
    }
}

/// One 1v1 duel. `player2_id` stays NULL while the match is waiting for an
/// opponent; the rating-change columns are written exactly once, at
/// finalization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Match {
    pub id: Uuid,
    pub player1_id: Uuid,
    pub player2_id: Option<Uuid>,
    pub status: MatchStatus,
    pub player1_score: i32,
    pub player2_score: i32,
    pub winner_id: Option<Uuid>,
    pub player1_rating_change: Option<i32>,
    pub player2_rating_change: Option<i32>,
    pub finish_reason: Option<FinalizeReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Match {
    pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<Match>, sqlx::Error> {
        sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.player1_id == user_id || self.player2_id == Some(user_id)
    }

    /// The other participant, if both sides are known.
    pub fn opponent_id(&self, user_id: Uuid) -> Option<Uuid> {
        if self.player1_id == user_id {
            self.player2_id
        } else if self.player2_id == Some(user_id) {
            Some(self.player1_id)
        } else {
            None
        }
    }
}

/// A player's latest answer to a match task. Upserted on the unique
/// `(match_id, user_id, task_id)` key, so at most one row per cell exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MatchAnswer {
    pub id: Uuid,
    pub match_id: Uuid,
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub answer_text: String,
    pub is_correct: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

/// The task projection sent to clients: everything needed to solve the
/// task, never the answer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskView {
    pub task_id: Uuid,
    #[sqlx(rename = "task_order")]
    pub order: i32,
    pub title: String,
    pub text: String,
    pub difficulty: i32,
    pub hints: Vec<String>,
}

impl TaskView {
    /// The ordered task set of a match, easiest bucket first.
    pub async fn for_match(pool: &PgPool, match_id: Uuid) -> Result<Vec<TaskView>, sqlx::Error> {
        sqlx::query_as::<_, TaskView>(
            "SELECT mt.task_id, mt.task_order, t.title, t.text, t.difficulty, t.hints
             FROM match_tasks mt
             JOIN tasks t ON t.id = mt.task_id
             WHERE mt.match_id = $1
             ORDER BY mt.task_order",
        )
        .bind(match_id)
        .fetch_all(pool)
        .await
    }
}

/// Response of `POST /api/pvp/find`. `opponent` is present only once the
/// match is active.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchResponse {
    pub match_id: Uuid,
    pub status: MatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent: Option<PlayerInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Response of `GET /api/pvp/match/{id}`: full participant view of a match.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchDetailResponse {
    pub match_id: Uuid,
    pub status: MatchStatus,
    pub player1: Option<PlayerInfo>,
    pub player2: Option<PlayerInfo>,
    pub tasks: Vec<TaskView>,
    pub player1_score: i32,
    pub player2_score: i32,
    pub winner_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForfeitResponse {
    pub ok: bool,
    pub winner_id: Option<Uuid>,
    /// The forfeiting caller's own rating delta.
    pub rating_change: i32,
}

/// Score pair embedded in the terminal `match_end` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinalScores {
    pub player1_score: i32,
    pub player2_score: i32,
}
