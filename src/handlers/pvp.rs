//! # PvP Control API
//!
//! Matchmaking and match inspection over plain HTTP. The handlers own the
//! transaction boundary: services lock and mutate rows, the handler
//! commits. Live-gameplay traffic runs over the match channel instead
//! (see [`crate::ws`]).

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::AuthUser,
    models::{
        AppState, CancelResponse, ForfeitResponse, Match, MatchDetailResponse, MatchResponse,
        MatchStatus, PlayerInfo, TaskView, User,
    },
    services::{
        match_logic::{self, FinalizeReason},
        matchmaking,
    },
    ws::ServerEvent,
};

/// Finds an opponent or leaves the caller waiting.
///
/// POST /api/pvp/find
///
/// Pairs the caller with the oldest compatible waiting match inside the
/// rating window, or parks them in a waiting match of their own. Safe to
/// poll: repeated calls return the same match until it changes state.
///
/// # Returns
///
/// - `200 OK` with `MatchResponse` - `opponent` is present iff the match is active
/// - `401 Unauthorized` - Missing or invalid authentication token
/// - `500 Internal Server Error` - Database error
#[instrument(
    skip_all,
    fields(
        user_id = %user.user_id,
        request_id = %uuid::Uuid::new_v4()
    )
)]
pub async fn find_match(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<MatchResponse>> {
    let caller = User::fetch(&state.db_pool, user.user_id)
        .await?
        .ok_or(AppError::Unauthorized("unknown user"))?;

    let mut tx = state.db_pool.begin().await?;
    let m = matchmaking::find_or_join(&mut tx, caller.id, caller.rating, &state.config).await?;
    tx.commit().await?;

    let opponent = match (m.status, m.opponent_id(caller.id)) {
        (MatchStatus::Active, Some(opponent_id)) => {
            PlayerInfo::fetch(&state.db_pool, opponent_id).await?
        }
        _ => None,
    };

    Ok(Json(MatchResponse {
        match_id: m.id,
        status: m.status,
        opponent,
    }))
}

/// Cancels the caller's own waiting match.
///
/// DELETE /api/pvp/find
///
/// Returns `{"cancelled": false}` when there is nothing to cancel, e.g.
/// the match was already claimed by another player.
#[instrument(
    skip_all,
    fields(
        user_id = %user.user_id,
        request_id = %uuid::Uuid::new_v4()
    )
)]
pub async fn cancel_find(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<CancelResponse>> {
    let mut tx = state.db_pool.begin().await?;
    let cancelled_id = matchmaking::cancel_waiting(&mut tx, user.user_id).await?;
    tx.commit().await?;

    Ok(Json(CancelResponse {
        cancelled: cancelled_id.is_some(),
    }))
}

/// Full participant view of a match: players, ordered tasks (without
/// answers), scores.
///
/// GET /api/pvp/match/{id}
///
/// # Returns
///
/// - `200 OK` with `MatchDetailResponse`
/// - `403 Forbidden` - Caller is not a participant
/// - `404 Not Found` - No such match
#[instrument(
    skip_all,
    fields(
        user_id = %user.user_id,
        match_id = %match_id,
        request_id = %uuid::Uuid::new_v4()
    )
)]
pub async fn get_match_detail(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Json<MatchDetailResponse>> {
    let m = Match::fetch(&state.db_pool, match_id)
        .await?
        .ok_or(AppError::NotFound("match not found"))?;

    if !m.is_participant(user.user_id) {
        warn!("Non-participant requested match detail");
        return Err(AppError::Forbidden("you are not a participant of this match"));
    }

    let player1 = PlayerInfo::fetch(&state.db_pool, m.player1_id).await?;
    let player2 = match m.player2_id {
        Some(id) => PlayerInfo::fetch(&state.db_pool, id).await?,
        None => None,
    };
    let tasks = TaskView::for_match(&state.db_pool, match_id).await?;

    Ok(Json(MatchDetailResponse {
        match_id: m.id,
        status: m.status,
        player1,
        player2,
        tasks,
        player1_score: m.player1_score,
        player2_score: m.player2_score,
        winner_id: m.winner_id,
        created_at: m.created_at,
    }))
}

/// Voluntary resignation: the caller loses, the opponent wins with full
/// ELO transfer, and both connected players receive `match_end`.
///
/// POST /api/pvp/match/{id}/forfeit
///
/// # Returns
///
/// - `200 OK` with `ForfeitResponse`
/// - `400 Bad Request` - Match is not active
/// - `403 Forbidden` - Caller is not a participant
/// - `404 Not Found` - No such match
#[instrument(
    skip_all,
    fields(
        user_id = %user.user_id,
        match_id = %match_id,
        request_id = %uuid::Uuid::new_v4()
    )
)]
pub async fn forfeit_match(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(match_id): Path<Uuid>,
) -> AppResult<Json<ForfeitResponse>> {
    let m = Match::fetch(&state.db_pool, match_id)
        .await?
        .ok_or(AppError::NotFound("match not found"))?;

    if !m.is_participant(user.user_id) {
        return Err(AppError::Forbidden("you are not a participant of this match"));
    }
    if m.status != MatchStatus::Active {
        return Err(AppError::InvalidState("match is not active"));
    }

    let outcome = match_logic::finalize_match(
        &state.db_pool,
        match_id,
        FinalizeReason::Forfeit,
        Some(user.user_id),
        &state.config,
    )
    .await?;

    if !outcome.was_already_terminal {
        info!(winner_id = ?outcome.winner_id, "User forfeited via control API");
        state
            .registry
            .broadcast(match_id, &ServerEvent::match_end(&outcome), None)
            .await;
    }

    Ok(Json(ForfeitResponse {
        ok: true,
        winner_id: outcome.winner_id,
        rating_change: outcome.rating_change_of(user.user_id),
    }))
}
