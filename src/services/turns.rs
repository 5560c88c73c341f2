//! Pickup/service turn booking.

use sqlx::PgPool;

use crate::error::Result;
use crate::models::{CreateTurnRequest, Turn};
use crate::services::users::UserService;

pub struct TurnService;

impl TurnService {
    pub async fn create_turn_for_user(
        pool: &PgPool,
        user_id: i64,
        req: CreateTurnRequest,
    ) -> Result<Turn> {
        let notes = req
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let mut tx = pool.begin().await?;
        UserService::get_by_id(&mut tx, user_id).await?;

        let turn = sqlx::query_as::<_, Turn>(
            "INSERT INTO turns (user_id, status, scheduled_at, notes)
             VALUES ($1, 'pending', $2, $3)
             RETURNING id, user_id, status, scheduled_at, notes, created_at, updated_at",
        )
        .bind(user_id)
        .bind(req.scheduled_at)
        .bind(&notes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(turn)
    }
}
