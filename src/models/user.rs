use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A registered player. The password hash never leaves the database; the
/// core only reads identity and rating, and only the finalizer writes the
/// rating back.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub rating: i32,
    pub role: String,
}

impl User {
    pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT id, username, email, rating, role FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

/// The slice of a user that may be shown to their opponent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlayerInfo {
    pub id: Uuid,
    pub username: String,
    pub rating: i32,
}

impl From<&User> for PlayerInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            rating: user.rating,
        }
    }
}

impl PlayerInfo {
    pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<PlayerInfo>, sqlx::Error> {
        sqlx::query_as::<_, PlayerInfo>("SELECT id, username, rating FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
