//! # ELO Rating Calculations
//!
//! Pure, deterministic rating math for finalized duels:
//!
//! ```text
//! E_a = 1 / (1 + 10^((R_b - R_a) / 400))
//! ΔR  = K × (S - E_a)       S ∈ {1.0 win, 0.5 draw, 0.0 loss}
//! ```
//!
//! Deltas for a match are approximately zero-sum; rounding can leave a
//! ±1 residue. The rating floor is applied by the caller when the deltas
//! are written back.

use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Beyond this exponent the expected score is clamped instead of computed,
/// keeping 10^x well away from overflow.
const MAX_EXPONENT: f64 = 10.0;

/// Expected score of a player rated `rating_a` against `rating_b`.
///
/// Returns a probability in (0, 1). Extreme rating gaps are clamped to
/// 0.001 / 0.999.
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    let exponent = f64::from(rating_b - rating_a) / 400.0;

    if exponent > MAX_EXPONENT {
        return 0.001;
    }
    if exponent < -MAX_EXPONENT {
        return 0.999;
    }

    1.0 / (1.0 + 10.0_f64.powf(exponent))
}

/// Rating delta for one player given the outcome from their perspective.
///
/// `outcome` must be 0.0 (loss), 0.5 (draw) or 1.0 (win); anything outside
/// `[0, 1]` is rejected as an invalid argument.
pub fn rating_change(
    player_rating: i32,
    opponent_rating: i32,
    outcome: f64,
    k_factor: i32,
) -> AppResult<i32> {
    if !(0.0..=1.0).contains(&outcome) {
        return Err(AppError::BadRequest("outcome must be within [0.0, 1.0]"));
    }

    let expected = expected_score(player_rating, opponent_rating);
    Ok((f64::from(k_factor) * (outcome - expected)).round() as i32)
}

/// Rating deltas for both players of a match. `winner_id = None` means a
/// draw; a winner who is not one of the two participants is rejected.
pub fn match_rating_changes(
    p1_rating: i32,
    p2_rating: i32,
    winner_id: Option<Uuid>,
    p1_id: Uuid,
    p2_id: Uuid,
    k_factor: i32,
) -> AppResult<(i32, i32)> {
    let (p1_outcome, p2_outcome) = match winner_id {
        None => (0.5, 0.5),
        Some(id) if id == p1_id => (1.0, 0.0),
        Some(id) if id == p2_id => (0.0, 1.0),
        Some(_) => {
            return Err(AppError::BadRequest(
                "winner is not a participant of this match",
            ));
        }
    };

    let p1_change = rating_change(p1_rating, p2_rating, p1_outcome, k_factor)?;
    let p2_change = rating_change(p2_rating, p1_rating, p2_outcome, k_factor)?;

    Ok((p1_change, p2_change))
}

/// Clamps a rating to the configured floor. There is no ceiling.
pub fn apply_rating_floor(rating: i32, min_rating: i32) -> i32 {
    rating.max(min_rating)
}
