//! # Match Channel Wire Protocol
//!
//! JSON messages exchanged on the duplex match channel. Every frame is an
//! object with a `type` discriminator. Server events never carry a task's
//! canonical answer; clients only ever see the [`TaskView`] projection.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use crate::models::{FinalScores, PlayerInfo, TaskView};
use crate::services::match_logic::FinalizeReason;

/// Unix timestamp (seconds) for event payloads.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Answer submission payload. Oversized answers are rejected before any
/// storage work happens.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitAnswer {
    pub task_id: Uuid,
    #[validate(length(min = 1, max = 10000))]
    pub answer: String,
}

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubmitAnswer(SubmitAnswer),
    Pong { timestamp: i64 },
}

/// Error codes surfaced in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidTask,
    NotParticipant,
    MatchNotFound,
    MatchNotAvailable,
    RateLimited,
    ConnectionError,
    InternalError,
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PlayerJoined {
        player: PlayerInfo,
    },
    MatchStart {
        tasks: Vec<TaskView>,
    },
    AnswerResult {
        task_id: Uuid,
        is_correct: bool,
        your_score: i32,
    },
    OpponentScored {
        task_id: Uuid,
        opponent_score: i32,
    },
    OpponentDisconnected {
        timestamp: i64,
        reconnecting: bool,
        timeout_seconds: u64,
    },
    OpponentReconnected {
        timestamp: i64,
    },
    DisconnectWarning {
        seconds_remaining: u64,
        user_id: Uuid,
    },
    ReconnectionSuccess {
        your_score: i32,
        opponent_score: i32,
        time_elapsed: i64,
        your_solved_tasks: Vec<Uuid>,
        opponent_solved_tasks: Vec<Uuid>,
        total_tasks: u32,
        reconnection_count: u32,
    },
    MatchEnd {
        reason: FinalizeReason,
        winner_id: Option<Uuid>,
        player1_rating_change: i32,
        player1_new_rating: i32,
        player2_rating_change: i32,
        player2_new_rating: i32,
        final_scores: FinalScores,
    },
    Ping {
        timestamp: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Builds the terminal event from a finalization outcome.
    pub fn match_end(outcome: &crate::services::match_logic::MatchOutcome) -> Self {
        Self::MatchEnd {
            reason: outcome.reason,
            winner_id: outcome.winner_id,
            player1_rating_change: outcome.player1_rating_change,
            player1_new_rating: outcome.player1_new_rating,
            player2_rating_change: outcome.player2_rating_change,
            player2_new_rating: outcome.player2_new_rating,
            final_scores: FinalScores {
                player1_score: outcome.player1_score,
                player2_score: outcome.player2_score,
            },
        }
    }
}
