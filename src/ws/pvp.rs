//! # Match Channel Runtime
//!
//! One task trio per client connection: a reader that processes inbound
//! frames strictly in receive order, a writer that owns the socket sink
//! (single-writer discipline; broadcasts and personal sends all funnel
//! through it), and a heartbeat ticker. The connection dies when any of
//! the three stops, after which the disconnect branch decides between
//! orphan cleanup, a grace timer for the peer, or a technical-error
//! finalization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::DisconnectPolicy;
use crate::error::{AppError, AppResult};
use crate::models::{AppState, Match, MatchStatus, PlayerInfo, TaskView, User};
use crate::services::match_logic::{self, FinalizeReason};
use crate::ws::events::{ClientMessage, ErrorCode, ServerEvent, SubmitAnswer, now_unix};
use crate::ws::manager::{EventSink, SinkClosed};

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub token: String,
}

/// Production [`EventSink`]: forwards into the connection's writer task.
struct ChannelSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: ServerEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).map_err(|_| SinkClosed)
    }
}

/// Upgrade handler for `GET /api/pvp/ws/{match_id}?token=<bearer>`.
///
/// Admission happens before the upgrade: the token must verify, the user
/// must be a participant, and the match must still accept connections.
#[instrument(skip_all, fields(match_id = %match_id))]
pub async fn match_channel(
    ws: WebSocketUpgrade,
    Path(match_id): Path<Uuid>,
    Query(query): Query<ChannelQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let claims = state
        .jwt_service
        .validate_access_token(&query.token)
        .map_err(|_| AppError::Unauthorized("invalid or expired token"))?;
    let user_id = Uuid::try_parse(&claims.sub)
        .map_err(|_| AppError::Unauthorized("invalid token subject"))?;

    let user = User::fetch(&state.db_pool, user_id)
        .await?
        .ok_or(AppError::Unauthorized("unknown user"))?;

    let m = Match::fetch(&state.db_pool, match_id)
        .await?
        .ok_or(AppError::NotFound("match not found"))?;
    if !m.is_participant(user_id) {
        return Err(AppError::Forbidden("you are not a participant of this match"));
    }
    if m.status.is_terminal() {
        return Err(AppError::InvalidState("match is no longer available"));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, match_id, user)))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, match_id: Uuid, user: User) {
    let user_id = user.id;
    let (ws_tx, mut ws_rx) = socket.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut send_task = tokio::spawn(write_loop(ws_tx, event_rx));

    let sink: Arc<dyn EventSink> = Arc::new(ChannelSink {
        tx: event_tx.clone(),
    });
    let session_token = Uuid::new_v4().to_string();

    let is_reconnect = match state
        .registry
        .connect_with_session(match_id, user_id, sink, session_token)
        .await
    {
        Ok(flag) => flag,
        Err(_) => {
            warn!(%match_id, %user_id, "Rejecting duplicate connection");
            let _ = event_tx.send(ServerEvent::error(
                ErrorCode::ConnectionError,
                "already connected to this match",
            ));
            drop(event_tx);
            let _ = send_task.await;
            return;
        }
    };

    if is_reconnect {
        on_reconnected(&state, match_id, &user, &event_tx).await;
    } else {
        if let Some(peer) = state.registry.opponent_of(match_id, user_id).await {
            state
                .registry
                .send_personal(
                    match_id,
                    peer,
                    ServerEvent::PlayerJoined {
                        player: PlayerInfo::from(&user),
                    },
                )
                .await;
        }

        if state.registry.both_present(match_id).await {
            if let Err(e) = start_match(&state, match_id).await {
                error!(error = %e, %match_id, "Failed to start match");
                let _ = event_tx.send(ServerEvent::error(
                    ErrorCode::InternalError,
                    "failed to start match",
                ));
            }
        }
    }

    // Millis since `started`, shared between reader and heartbeat.
    let started = Instant::now();
    let last_seen = Arc::new(AtomicU64::new(0));

    let hb_tx = event_tx.clone();
    let hb_last_seen = Arc::clone(&last_seen);
    let heartbeat_interval = state.config.heartbeat_interval;
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            let seen = Duration::from_millis(hb_last_seen.load(Ordering::Relaxed));
            if started.elapsed().saturating_sub(seen) > heartbeat_timeout {
                warn!(%match_id, %user_id, "Heartbeat timeout, closing connection");
                break;
            }
            if hb_tx
                .send(ServerEvent::Ping {
                    timestamp: now_unix(),
                })
                .is_err()
            {
                break;
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_user = user.clone();
    let recv_tx = event_tx.clone();
    let recv_last_seen = Arc::clone(&last_seen);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            recv_last_seen.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            match message {
                Message::Text(text) => {
                    handle_client_message(&recv_state, match_id, &recv_user, text.as_str(), &recv_tx)
                        .await;
                }
                Message::Close(_) => break,
                // Protocol-level ping/pong is handled by axum itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {
            send_task.abort();
            heartbeat_task.abort();
        }
        _ = &mut heartbeat_task => {
            recv_task.abort();
            send_task.abort();
        }
        _ = &mut send_task => {
            recv_task.abort();
            heartbeat_task.abort();
        }
    }

    handle_disconnect(&state, match_id, &user).await;
    info!(%match_id, %user_id, "Match channel closed");
}

/// Owns the socket sink; every outbound event of this connection passes
/// through here, so concurrent broadcasts serialize at the channel.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Failed to serialize outbound event");
                continue;
            }
        };
        if ws_tx.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// Peer notification plus full state sync for a returning player.
async fn on_reconnected(
    state: &Arc<AppState>,
    match_id: Uuid,
    user: &User,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    let registry = &state.registry;

    if let Some(peer) = registry.opponent_of(match_id, user.id).await {
        registry
            .send_personal(
                match_id,
                peer,
                ServerEvent::OpponentReconnected {
                    timestamp: now_unix(),
                },
            )
            .await;
    }

    match match_logic::match_snapshot(&state.db_pool, match_id).await {
        Ok(snap) => {
            let reconnection_count = registry.reconnection_count(match_id, user.id).await;
            let (your_score, opponent_score, your_solved, opponent_solved) =
                if user.id == snap.player1_id {
                    (
                        snap.player1_score,
                        snap.player2_score,
                        snap.player1_solved_tasks,
                        snap.player2_solved_tasks,
                    )
                } else {
                    (
                        snap.player2_score,
                        snap.player1_score,
                        snap.player2_solved_tasks,
                        snap.player1_solved_tasks,
                    )
                };

            let _ = event_tx.send(ServerEvent::ReconnectionSuccess {
                your_score,
                opponent_score,
                time_elapsed: snap.time_elapsed,
                your_solved_tasks: your_solved,
                opponent_solved_tasks: opponent_solved,
                total_tasks: snap.total_tasks,
                reconnection_count,
            });
        }
        Err(e) => {
            error!(error = %e, %match_id, "Failed to build reconnection snapshot");
            let _ = event_tx.send(ServerEvent::error(
                ErrorCode::InternalError,
                "failed to load match state",
            ));
        }
    }
}

/// Promotes the match to active (idempotent) and deals the task set to
/// both players. Called when both participants are first present.
async fn start_match(state: &Arc<AppState>, match_id: Uuid) -> AppResult<()> {
    let (_, m) = match_logic::activate_match(&state.db_pool, match_id).await?;
    if m.status != MatchStatus::Active {
        return Ok(());
    }

    let tasks = TaskView::for_match(&state.db_pool, match_id).await?;
    state
        .registry
        .broadcast(match_id, &ServerEvent::MatchStart { tasks }, None)
        .await;
    Ok(())
}

async fn handle_client_message(
    state: &Arc<AppState>,
    match_id: Uuid,
    user: &User,
    raw: &str,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    let message = match serde_json::from_str::<ClientMessage>(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "Unparsable inbound frame");
            let _ = event_tx.send(ServerEvent::error(
                ErrorCode::InvalidMessage,
                "malformed message",
            ));
            return;
        }
    };

    match message {
        // Any inbound frame already refreshed the heartbeat deadline
        ClientMessage::Pong { .. } => {}
        ClientMessage::SubmitAnswer(payload) => {
            if payload.validate().is_err() {
                let _ = event_tx.send(ServerEvent::error(
                    ErrorCode::InvalidMessage,
                    "answer length out of bounds",
                ));
                return;
            }
            handle_answer(state, match_id, user, payload, event_tx).await;
        }
    }
}

async fn handle_answer(
    state: &Arc<AppState>,
    match_id: Uuid,
    user: &User,
    payload: SubmitAnswer,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    let registry = &state.registry;

    let (allowed, wait_seconds) = registry.check_rate_limit(match_id, user.id).await;
    if !allowed {
        let _ = event_tx.send(submit_error_event(&AppError::RateLimited { wait_seconds }));
        return;
    }

    let (is_correct, new_score) = match match_logic::submit_answer(
        &state.db_pool,
        match_id,
        user.id,
        payload.task_id,
        &payload.answer,
    )
    .await
    {
        Ok(result) => result,
        Err(e) => {
            debug!(error = %e, %match_id, user_id = %user.id, "Answer rejected");
            let _ = event_tx.send(submit_error_event(&e));
            return;
        }
    };

    // The sender sees its own result before the peer notification; there
    // is no cross-player ordering guarantee.
    let _ = event_tx.send(ServerEvent::AnswerResult {
        task_id: payload.task_id,
        is_correct,
        your_score: new_score,
    });

    if is_correct {
        if let Some(peer) = registry.opponent_of(match_id, user.id).await {
            registry
                .send_personal(
                    match_id,
                    peer,
                    ServerEvent::OpponentScored {
                        task_id: payload.task_id,
                        opponent_score: new_score,
                    },
                )
                .await;
        }
    }

    match match_logic::check_match_completion(&state.db_pool, match_id).await {
        Ok(true) => {
            finalize_and_broadcast(state, match_id, FinalizeReason::Completion, None).await;
        }
        Ok(false) => {}
        Err(e) => error!(error = %e, %match_id, "Completion check failed"),
    }
}

fn submit_error_event(e: &AppError) -> ServerEvent {
    match e {
        AppError::BadRequest(msg) => ServerEvent::error(ErrorCode::InvalidTask, *msg),
        AppError::Forbidden(msg) => ServerEvent::error(ErrorCode::NotParticipant, *msg),
        AppError::NotFound(msg) => ServerEvent::error(ErrorCode::MatchNotFound, *msg),
        AppError::InvalidState(msg) => ServerEvent::error(ErrorCode::MatchNotAvailable, *msg),
        AppError::RateLimited { wait_seconds } => ServerEvent::error(
            ErrorCode::RateLimited,
            format!("rate limited, retry in {wait_seconds:.1}s"),
        ),
        _ => ServerEvent::error(ErrorCode::InternalError, "internal error"),
    }
}

/// Finalizes the match and emits `match_end` once. A call that finds the
/// match already terminal stays silent; the winning trigger has emitted
/// the event.
pub async fn finalize_and_broadcast(
    state: &Arc<AppState>,
    match_id: Uuid,
    reason: FinalizeReason,
    forfeiting_user_id: Option<Uuid>,
) {
    match match_logic::finalize_match(
        &state.db_pool,
        match_id,
        reason,
        forfeiting_user_id,
        &state.config,
    )
    .await
    {
        Ok(outcome) if !outcome.was_already_terminal => {
            state
                .registry
                .broadcast(match_id, &ServerEvent::match_end(&outcome), None)
                .await;
        }
        Ok(_) => debug!(%match_id, "Match already finalized elsewhere"),
        Err(AppError::InvalidState(_)) => debug!(%match_id, "Finalization lost the race"),
        Err(e) => error!(error = %e, %match_id, "Finalization failed"),
    }
}

/// Runs after the connection ends, however it ended.
#[instrument(skip(state, user), fields(match_id = %match_id, user_id = %user.id))]
async fn handle_disconnect(state: &Arc<AppState>, match_id: Uuid, user: &User) {
    let user_id = user.id;
    let registry = &state.registry;

    registry.reset_rate_limit(match_id, user_id).await;
    registry.disconnect(match_id, user_id).await;

    let m = match Match::fetch(&state.db_pool, match_id).await {
        Ok(Some(m)) => m,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "Failed to load match during disconnect");
            return;
        }
    };

    match m.status {
        MatchStatus::Waiting => {
            // Creator left before anyone joined; no ELO involved.
            if let Err(e) =
                match_logic::cleanup_orphaned_waiting(&state.db_pool, match_id, user_id).await
            {
                error!(error = %e, "Orphan cleanup failed");
            }
        }
        MatchStatus::Active => {
            let live_peer = match m.opponent_id(user_id) {
                Some(peer_id) => registry
                    .is_connected(match_id, peer_id)
                    .await
                    .then_some(peer_id),
                None => None,
            };
            match live_peer {
                Some(peer_id) => {
                    let (_, penalty) = registry.flapping_check(match_id, user_id).await;
                    let timeout_seconds = state
                        .config
                        .disconnect_timeout
                        .as_secs()
                        .saturating_sub(penalty)
                        .max(1);

                    registry
                        .send_personal(
                            match_id,
                            peer_id,
                            ServerEvent::OpponentDisconnected {
                                timestamp: now_unix(),
                                reconnecting: true,
                                timeout_seconds,
                            },
                        )
                        .await;

                    let expire_state = Arc::clone(state);
                    let policy = state.config.disconnect_policy;
                    Arc::clone(&state.registry)
                        .arm_disconnect_timer(
                            match_id,
                            user_id,
                            Duration::from_secs(timeout_seconds),
                            async move {
                                let (reason, forfeiter) = match policy {
                                    DisconnectPolicy::Forfeit => {
                                        (FinalizeReason::Forfeit, Some(user_id))
                                    }
                                    DisconnectPolicy::TechnicalError => {
                                        (FinalizeReason::TechnicalError, None)
                                    }
                                };
                                finalize_and_broadcast(&expire_state, match_id, reason, forfeiter)
                                    .await;
                            },
                        )
                        .await;
                }
                None => {
                    // Both sides gone: indeterminate outcome, no rating change.
                    finalize_and_broadcast(state, match_id, FinalizeReason::TechnicalError, None)
                        .await;
                }
            }
        }
        _ => {}
    }
}
