//! # Task Selection
//!
//! Picks the task set for a freshly paired match: a uniformly random
//! sample per difficulty bucket, ordered easiest bucket first. The rows
//! are inserted inside the matchmaker's transaction so pairing and task
//! assignment commit atomically.

use rand::seq::IndexedRandom;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::QuotaBucket;
use crate::error::AppResult;

/// Populates `match_tasks` for `match_id` according to `quota`.
///
/// Buckets with fewer eligible tasks than requested contribute what they
/// have (with a warning); `task_order` runs 1..N across buckets in quota
/// order. Returns the number of assigned tasks.
#[instrument(skip(tx, quota), fields(match_id = %match_id))]
pub async fn select_tasks(
    tx: &mut Transaction<'_, Postgres>,
    match_id: Uuid,
    quota: &[QuotaBucket],
) -> AppResult<usize> {
    let mut picked: Vec<Uuid> = Vec::new();

    for bucket in quota {
        let eligible: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE difficulty BETWEEN $1 AND $2",
        )
        .bind(bucket.min_difficulty)
        .bind(bucket.max_difficulty)
        .fetch_all(tx.as_mut())
        .await?;

        if eligible.len() < bucket.count {
            warn!(
                min_difficulty = bucket.min_difficulty,
                max_difficulty = bucket.max_difficulty,
                wanted = bucket.count,
                available = eligible.len(),
                "Difficulty bucket is short on tasks"
            );
        }

        // The rng must not be held across an await
        let chosen: Vec<Uuid> = {
            let mut rng = rand::rng();
            eligible
                .choose_multiple(&mut rng, bucket.count)
                .copied()
                .collect()
        };
        picked.extend(chosen);
    }

    for (index, task_id) in picked.iter().enumerate() {
        sqlx::query(
            "INSERT INTO match_tasks (match_id, task_id, task_order) VALUES ($1, $2, $3)",
        )
        .bind(match_id)
        .bind(task_id)
        .bind((index + 1) as i32)
        .execute(tx.as_mut())
        .await?;
    }

    debug!(assigned = picked.len(), "Assigned tasks to match");
    Ok(picked.len())
}
