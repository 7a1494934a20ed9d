//! # Connection Registry
//!
//! In-process rooms of live match-channel connections, keyed by match id.
//! Each room carries its own mutex; every mutation happens under it, while
//! actual sends happen outside it (recipients are collected first, broken
//! connections are reaped afterwards). Session records outlive a transient
//! disconnect so a reconnect can cancel the armed grace timer.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PvpConfig;
use crate::error::{AppError, AppResult};
use crate::ws::events::ServerEvent;

/// Minimum interval between answer submissions per (match, user).
const ANSWER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
#[error("connection sink closed")]
pub struct SinkClosed;

/// Outbound handle of one live connection. The production impl forwards
/// into the per-connection writer task; tests use an in-memory recorder.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ServerEvent) -> Result<(), SinkClosed>;
}

/// Per-player connection state that survives a transient disconnect.
struct SessionRecord {
    session_token: String,
    disconnect_timer: Option<JoinHandle<()>>,
    disconnect_started_at: Option<Instant>,
    reconnection_count: u32,
    /// Anchor of the flapping window; reconnection counting restarts when
    /// the window has fully elapsed.
    window_started_at: Instant,
}

impl SessionRecord {
    fn new(session_token: String) -> Self {
        Self {
            session_token,
            disconnect_timer: None,
            disconnect_started_at: None,
            reconnection_count: 0,
            window_started_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, Arc<dyn EventSink>>,
    sessions: HashMap<Uuid, SessionRecord>,
    rate_limits: HashMap<Uuid, Instant>,
}

impl Room {
    fn abort_timers(&mut self) {
        for session in self.sessions.values_mut() {
            if let Some(handle) = session.disconnect_timer.take() {
                handle.abort();
            }
        }
    }
}

/// Process-wide registry of match rooms. One instance lives in
/// [`crate::models::AppState`]; timers spawned from it are stopped on
/// shutdown via the embedded cancellation token.
pub struct ConnectionRegistry {
    rooms: DashMap<Uuid, Arc<Mutex<Room>>>,
    config: PvpConfig,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(config: PvpConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    fn room(&self, match_id: Uuid) -> Option<Arc<Mutex<Room>>> {
        self.rooms.get(&match_id).map(|r| Arc::clone(r.value()))
    }

    fn room_or_create(&self, match_id: Uuid) -> Arc<Mutex<Room>> {
        Arc::clone(self.rooms.entry(match_id).or_default().value())
    }

    /// Registers a connection, detecting reconnects.
    ///
    /// A prior session with an armed disconnect timer means this is the
    /// same player coming back: the timer is cancelled, the sink swapped
    /// in and the reconnection counter bumped. A second live connection
    /// for the same user is rejected.
    #[instrument(skip(self, sink, session_token), fields(match_id = %match_id, user_id = %user_id))]
    pub async fn connect_with_session(
        &self,
        match_id: Uuid,
        user_id: Uuid,
        sink: Arc<dyn EventSink>,
        session_token: String,
    ) -> AppResult<bool> {
        let room_arc = self.room_or_create(match_id);
        let mut room = room_arc.lock().await;
        let room = &mut *room;

        if let Some(session) = room.sessions.get_mut(&user_id)
            && let Some(timer) = session.disconnect_timer.take()
        {
            timer.abort();

            if session.window_started_at.elapsed() > self.config.flapping_window {
                session.window_started_at = Instant::now();
                session.reconnection_count = 1;
            } else {
                session.reconnection_count += 1;
            }

            let disconnect_secs = session
                .disconnect_started_at
                .take()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            session.session_token = session_token;

            info!(
                reconnection_count = session.reconnection_count,
                disconnect_secs,
                session = %session.session_token,
                "Player reconnected to match"
            );
            room.members.insert(user_id, sink);
            return Ok(true);
        }

        if room.members.contains_key(&user_id) {
            return Err(AppError::Conflict("user already connected to this match"));
        }

        room.members.insert(user_id, sink);
        room.sessions
            .insert(user_id, SessionRecord::new(session_token));
        info!("Player connected to match");
        Ok(false)
    }

    /// Removes a live connection. The session record stays while its
    /// disconnect timer is armed; the whole room (sessions, rate limits,
    /// timers) is dropped once no live member remains.
    #[instrument(skip(self), fields(match_id = %match_id, user_id = %user_id))]
    pub async fn disconnect(&self, match_id: Uuid, user_id: Uuid) {
        let Some(room_arc) = self.room(match_id) else {
            return;
        };

        let mut room = room_arc.lock().await;
        if room.members.remove(&user_id).is_some() {
            info!("Player disconnected from match");
        }

        if room.members.is_empty() {
            room.abort_timers();
            room.sessions.clear();
            room.rate_limits.clear();
            drop(room);
            // Re-check under the map entry: a concurrent connect may have
            // revived the room between the unlock and the removal.
            self.rooms.remove_if(&match_id, |_, v| {
                v.try_lock().map(|r| r.members.is_empty()).unwrap_or(false)
            });
            debug!("Room is empty, dropped");
        }
    }

    /// Sends one event to one player. A failed send drops that player's
    /// connection.
    pub async fn send_personal(&self, match_id: Uuid, user_id: Uuid, event: ServerEvent) {
        let sink = match self.room(match_id) {
            Some(room_arc) => room_arc.lock().await.members.get(&user_id).cloned(),
            None => None,
        };

        let Some(sink) = sink else {
            warn!(%match_id, %user_id, "Player not connected, event dropped");
            return;
        };

        if sink.send(event).await.is_err() {
            warn!(%match_id, %user_id, "Send failed, dropping connection");
            self.disconnect(match_id, user_id).await;
        }
    }

    /// Sends one event to every live member of the room, optionally
    /// excluding one player. Recipients are collected under the room
    /// mutex, sends happen after it is released.
    pub async fn broadcast(&self, match_id: Uuid, event: &ServerEvent, exclude: Option<Uuid>) {
        let Some(room_arc) = self.room(match_id) else {
            return;
        };

        let recipients: Vec<(Uuid, Arc<dyn EventSink>)> = {
            let room = room_arc.lock().await;
            room.members
                .iter()
                .filter(|(uid, _)| Some(**uid) != exclude)
                .map(|(uid, sink)| (*uid, Arc::clone(sink)))
                .collect()
        };

        let mut broken = Vec::new();
        for (user_id, sink) in recipients {
            if sink.send(event.clone()).await.is_err() {
                warn!(%match_id, %user_id, "Broadcast send failed");
                broken.push(user_id);
            }
        }
        for user_id in broken {
            self.disconnect(match_id, user_id).await;
        }
    }

    /// The other live member of the room, if any.
    pub async fn opponent_of(&self, match_id: Uuid, user_id: Uuid) -> Option<Uuid> {
        let room_arc = self.room(match_id)?;
        let room = room_arc.lock().await;
        room.members.keys().find(|uid| **uid != user_id).copied()
    }

    pub async fn both_present(&self, match_id: Uuid) -> bool {
        match self.room(match_id) {
            Some(room_arc) => room_arc.lock().await.members.len() == 2,
            None => false,
        }
    }

    pub async fn is_connected(&self, match_id: Uuid, user_id: Uuid) -> bool {
        match self.room(match_id) {
            Some(room_arc) => room_arc.lock().await.members.contains_key(&user_id),
            None => false,
        }
    }

    pub async fn members(&self, match_id: Uuid) -> HashSet<Uuid> {
        match self.room(match_id) {
            Some(room_arc) => room_arc.lock().await.members.keys().copied().collect(),
            None => HashSet::new(),
        }
    }

    /// Arms the disconnect grace timer for a player whose connection just
    /// dropped. While the timer runs, the opponent receives progressive
    /// `disconnect_warning` events at the configured seconds-remaining
    /// marks; if it expires uncancelled, `on_expire` runs. A reconnect
    /// cancels the timer synchronously via [`Self::connect_with_session`].
    #[instrument(skip(self, on_expire), fields(match_id = %match_id, user_id = %user_id))]
    pub async fn arm_disconnect_timer<F>(
        self: Arc<Self>,
        match_id: Uuid,
        user_id: Uuid,
        timeout: Duration,
        on_expire: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(room_arc) = self.room(match_id) else {
            warn!("No room, cannot arm disconnect timer");
            return;
        };
        let mut room = room_arc.lock().await;
        let room = &mut *room;
        let Some(session) = room.sessions.get_mut(&user_id) else {
            warn!("No session, cannot arm disconnect timer");
            return;
        };

        if let Some(stale) = session.disconnect_timer.take() {
            stale.abort();
        }
        session.disconnect_started_at = Some(Instant::now());

        let registry = Arc::clone(&self);
        let shutdown = self.shutdown.clone();
        let total = timeout.as_secs();
        let mut offsets: Vec<u64> = self
            .config
            .disconnect_warning_offsets
            .iter()
            .copied()
            .filter(|o| *o < total)
            .collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));

        let handle = tokio::spawn(async move {
            let countdown = async {
                let mut elapsed = 0u64;
                for remaining in offsets {
                    let fire_at = total - remaining;
                    if fire_at > elapsed {
                        tokio::time::sleep(Duration::from_secs(fire_at - elapsed)).await;
                        elapsed = fire_at;
                    }
                    if let Some(opponent) = registry.opponent_of(match_id, user_id).await {
                        debug!(%match_id, %user_id, remaining, "Sending disconnect warning");
                        registry
                            .send_personal(
                                match_id,
                                opponent,
                                ServerEvent::DisconnectWarning {
                                    seconds_remaining: remaining,
                                    user_id,
                                },
                            )
                            .await;
                    }
                }
                if total > elapsed {
                    tokio::time::sleep(Duration::from_secs(total - elapsed)).await;
                }

                // A reconnect that raced with the arming of this timer
                // leaves the player live; never expire a live connection.
                if registry.is_connected(match_id, user_id).await {
                    debug!(%match_id, %user_id, "Player is back, skipping expiry");
                    return;
                }

                warn!(%match_id, %user_id, "Disconnect grace window expired");
                on_expire.await;
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(%match_id, %user_id, "Disconnect timer stopped by shutdown");
                }
                _ = countdown => {}
            }
        });

        session.disconnect_timer = Some(handle);
    }

    /// Cancels an armed disconnect timer. Returns whether one was armed.
    pub async fn cancel_disconnect_timer(&self, match_id: Uuid, user_id: Uuid) -> bool {
        let Some(room_arc) = self.room(match_id) else {
            return false;
        };
        let mut room = room_arc.lock().await;
        let Some(session) = room.sessions.get_mut(&user_id) else {
            return false;
        };

        match session.disconnect_timer.take() {
            Some(handle) => {
                handle.abort();
                session.disconnect_started_at = None;
                true
            }
            None => false,
        }
    }

    /// 1 Hz answer rate limit per (match, user), measured on a monotonic
    /// clock. Returns `(allowed, seconds_until_allowed)`.
    pub async fn check_rate_limit(&self, match_id: Uuid, user_id: Uuid) -> (bool, f64) {
        let Some(room_arc) = self.room(match_id) else {
            return (true, 0.0);
        };
        let mut room = room_arc.lock().await;
        let now = Instant::now();

        match room.rate_limits.get_mut(&user_id) {
            Some(last) => {
                let since = now.duration_since(*last);
                if since < ANSWER_INTERVAL {
                    let wait = (ANSWER_INTERVAL - since).as_secs_f64();
                    debug!(%match_id, %user_id, wait, "Answer rate limit exceeded");
                    (false, wait)
                } else {
                    *last = now;
                    (true, 0.0)
                }
            }
            None => {
                room.rate_limits.insert(user_id, now);
                (true, 0.0)
            }
        }
    }

    pub async fn reset_rate_limit(&self, match_id: Uuid, user_id: Uuid) {
        if let Some(room_arc) = self.room(match_id) {
            room_arc.lock().await.rate_limits.remove(&user_id);
        }
    }

    pub async fn reconnection_count(&self, match_id: Uuid, user_id: Uuid) -> u32 {
        match self.room(match_id) {
            Some(room_arc) => room_arc
                .lock()
                .await
                .sessions
                .get(&user_id)
                .map(|s| s.reconnection_count)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Flapping = at least `flapping_max_disconnects` reconnects within the
    /// tracked window. Returns `(is_flapping, penalty_seconds)`; the
    /// penalty shortens the next grace timeout.
    pub async fn flapping_check(&self, match_id: Uuid, user_id: Uuid) -> (bool, u64) {
        let Some(room_arc) = self.room(match_id) else {
            return (false, 0);
        };
        let room = room_arc.lock().await;
        let Some(session) = room.sessions.get(&user_id) else {
            return (false, 0);
        };

        if session.reconnection_count >= self.config.flapping_max_disconnects
            && session.window_started_at.elapsed() <= self.config.flapping_window
        {
            let penalty = (self.config.disconnect_timeout.as_secs_f64()
                * self.config.flapping_penalty_multiplier) as u64;
            warn!(
                %match_id, %user_id,
                reconnection_count = session.reconnection_count,
                penalty, "Flapping detected"
            );
            (true, penalty)
        } else {
            (false, 0)
        }
    }

    pub async fn total_connections(&self) -> usize {
        let mut total = 0;
        let rooms: Vec<Arc<Mutex<Room>>> =
            self.rooms.iter().map(|e| Arc::clone(e.value())).collect();
        for room in rooms {
            total += room.lock().await.members.len();
        }
        total
    }

    pub fn total_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Closes every connection and cancels every timer. Called once at
    /// process shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let match_ids: Vec<Uuid> = self.rooms.iter().map(|e| *e.key()).collect();
        for match_id in match_ids {
            if let Some((_, room_arc)) = self.rooms.remove(&match_id) {
                let mut room = room_arc.lock().await;
                room.abort_timers();
                // Dropping the sinks ends the per-connection writer tasks,
                // which closes the sockets.
                room.members.clear();
                room.sessions.clear();
                room.rate_limits.clear();
            }
        }
        info!("Connection registry shut down");
    }
}
