//! # Match Runtime Configuration
//!
//! Tunables for matchmaking, disconnect handling and rating updates.
//! Every option has a production default and can be overridden through an
//! environment variable of the same (upper-cased) name. Required settings
//! like `DATABASE_URL` and `JWT_SECRET` are read elsewhere and stay fatal
//! when missing; everything here degrades to its default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// How long a disconnected player has to reconnect before the match ends.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Seconds-remaining marks at which the opponent is warned about an
/// impending disconnect timeout.
pub const DEFAULT_DISCONNECT_WARNING_OFFSETS: [u64; 3] = [15, 10, 5];

/// Half-width of the rating window used when pairing players.
pub const DEFAULT_RATING_MATCH_WINDOW: i32 = 200;

/// Interval between server heartbeat pings on the match channel.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound silence after which a connection is considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Rating volatility factor for established players.
pub const DEFAULT_K_FACTOR: i32 = 32;

/// Ratings never drop below this floor, no matter the loss streak.
pub const DEFAULT_MIN_RATING: i32 = 100;

/// What to do when a disconnect timer expires without a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// The disconnected player loses; full ELO transfer to the survivor.
    Forfeit,
    /// The match ends without a winner and ratings stay untouched.
    TechnicalError,
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forfeit" => Ok(Self::Forfeit),
            "technical_error" => Ok(Self::TechnicalError),
            other => Err(format!("unknown disconnect policy: {other}")),
        }
    }
}

/// One difficulty bucket of the task quota: pick `count` tasks whose
/// difficulty lies in `[min_difficulty, max_difficulty]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBucket {
    pub min_difficulty: i32,
    pub max_difficulty: i32,
    pub count: usize,
}

/// Default quota: two easy, two medium, one hard.
pub fn default_task_quota() -> Vec<QuotaBucket> {
    vec![
        QuotaBucket {
            min_difficulty: 1,
            max_difficulty: 2,
            count: 2,
        },
        QuotaBucket {
            min_difficulty: 3,
            max_difficulty: 3,
            count: 2,
        },
        QuotaBucket {
            min_difficulty: 4,
            max_difficulty: 5,
            count: 1,
        },
    ]
}

/// Runtime configuration shared through [`crate::models::AppState`].
#[derive(Debug, Clone)]
pub struct PvpConfig {
    pub rating_match_window: i32,
    pub task_quota: Vec<QuotaBucket>,
    pub disconnect_timeout: Duration,
    pub disconnect_warning_offsets: Vec<u64>,
    pub flapping_window: Duration,
    pub flapping_max_disconnects: u32,
    pub flapping_penalty_multiplier: f64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub k_factor: i32,
    pub min_rating: i32,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for PvpConfig {
    fn default() -> Self {
        Self {
            rating_match_window: DEFAULT_RATING_MATCH_WINDOW,
            task_quota: default_task_quota(),
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_warning_offsets: DEFAULT_DISCONNECT_WARNING_OFFSETS.to_vec(),
            flapping_window: Duration::from_secs(60),
            flapping_max_disconnects: 3,
            flapping_penalty_multiplier: 0.5,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            k_factor: DEFAULT_K_FACTOR,
            min_rating: DEFAULT_MIN_RATING,
            disconnect_policy: DisconnectPolicy::Forfeit,
        }
    }
}

impl PvpConfig {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable (with a warning).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_env::<i32>("RATING_MATCH_WINDOW") {
            cfg.rating_match_window = v;
        }
        if let Ok(raw) = env::var("TASK_QUOTA") {
            match parse_task_quota(&raw) {
                Ok(quota) => cfg.task_quota = quota,
                Err(e) => warn!(error = %e, "Ignoring invalid TASK_QUOTA"),
            }
        }
        if let Some(v) = parse_env::<u64>("DISCONNECT_TIMEOUT_SECONDS") {
            cfg.disconnect_timeout = Duration::from_secs(v);
        }
        if let Ok(raw) = env::var("DISCONNECT_WARNING_OFFSETS") {
            match parse_offsets(&raw) {
                Ok(offsets) => cfg.disconnect_warning_offsets = offsets,
                Err(e) => warn!(error = %e, "Ignoring invalid DISCONNECT_WARNING_OFFSETS"),
            }
        }
        if let Some(v) = parse_env::<u64>("FLAPPING_WINDOW_SECONDS") {
            cfg.flapping_window = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u32>("FLAPPING_MAX_DISCONNECTS") {
            cfg.flapping_max_disconnects = v;
        }
        if let Some(v) = parse_env::<f64>("FLAPPING_PENALTY_MULTIPLIER") {
            cfg.flapping_penalty_multiplier = v;
        }
        if let Some(v) = parse_env::<u64>("HEARTBEAT_INTERVAL_SECONDS") {
            cfg.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("HEARTBEAT_TIMEOUT_SECONDS") {
            cfg.heartbeat_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<i32>("K_FACTOR") {
            cfg.k_factor = v;
        }
        if let Some(v) = parse_env::<i32>("MIN_RATING") {
            cfg.min_rating = v;
        }
        if let Some(v) = parse_env::<DisconnectPolicy>("DISCONNECT_POLICY") {
            cfg.disconnect_policy = v;
        }

        cfg
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(%name, %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Parses a quota spec such as `1-2:2,3-3:2,4-5:1`.
fn parse_task_quota(raw: &str) -> Result<Vec<QuotaBucket>, String> {
    let mut quota = Vec::new();

    for part in raw.split(',') {
        let part = part.trim();
        let (range, count) = part
            .split_once(':')
            .ok_or_else(|| format!("missing count in quota bucket: {part}"))?;
        let (lo, hi) = range
            .split_once('-')
            .ok_or_else(|| format!("missing difficulty range in quota bucket: {part}"))?;

        let min_difficulty: i32 = lo.trim().parse().map_err(|_| format!("bad range: {part}"))?;
        let max_difficulty: i32 = hi.trim().parse().map_err(|_| format!("bad range: {part}"))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| format!("bad count: {part}"))?;

        if min_difficulty > max_difficulty || !(1..=5).contains(&min_difficulty) {
            return Err(format!("difficulty range out of bounds: {part}"));
        }
        quota.push(QuotaBucket {
            min_difficulty,
            max_difficulty,
            count,
        });
    }

    if quota.is_empty() {
        return Err("empty quota".to_string());
    }
    Ok(quota)
}

/// Parses a comma-separated list of seconds-remaining marks, e.g. `15,10,5`.
fn parse_offsets(raw: &str) -> Result<Vec<u64>, String> {
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| format!("bad warning offset: {s}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_settings() {
        let cfg = PvpConfig::default();
        assert_eq!(cfg.rating_match_window, 200);
        assert_eq!(cfg.disconnect_timeout, Duration::from_secs(30));
        assert_eq!(cfg.disconnect_warning_offsets, vec![15, 10, 5]);
        assert_eq!(cfg.k_factor, 32);
        assert_eq!(cfg.min_rating, 100);
        assert_eq!(cfg.disconnect_policy, DisconnectPolicy::Forfeit);
        let total: usize = cfg.task_quota.iter().map(|b| b.count).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn parses_quota_spec() {
        let quota = parse_task_quota("1-2:2, 3-3:2, 4-5:1").unwrap();
        assert_eq!(quota.len(), 3);
        assert_eq!(quota[0].min_difficulty, 1);
        assert_eq!(quota[0].max_difficulty, 2);
        assert_eq!(quota[0].count, 2);
        assert_eq!(quota[2].count, 1);
    }

    #[test]
    fn rejects_malformed_quota() {
        assert!(parse_task_quota("1-2").is_err());
        assert!(parse_task_quota("5-1:2").is_err());
        assert!(parse_task_quota("0-2:1").is_err());
        assert!(parse_task_quota("").is_err());
    }

    #[test]
    fn parses_warning_offsets() {
        assert_eq!(parse_offsets("15,10,5").unwrap(), vec![15, 10, 5]);
        assert!(parse_offsets("15,x").is_err());
    }

    #[test]
    fn parses_disconnect_policy() {
        assert_eq!(
            "forfeit".parse::<DisconnectPolicy>().unwrap(),
            DisconnectPolicy::Forfeit
        );
        assert_eq!(
            "Technical_Error".parse::<DisconnectPolicy>().unwrap(),
            DisconnectPolicy::TechnicalError
        );
        assert!("draw".parse::<DisconnectPolicy>().is_err());
    }
}
