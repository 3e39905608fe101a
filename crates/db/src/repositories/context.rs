use chrono::Utc;
use sqlx::Row;

use aisle_core::domain::cart::{Cart, CartLine};
use aisle_core::domain::turn::UserId;

use super::{ContextRepository, RepositoryError, StoredContext};
use crate::DbPool;

pub struct SqlContextRepository {
    pool: DbPool,
}

impl SqlContextRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_line(row: &sqlx::sqlite::SqliteRow) -> Result<CartLine, RepositoryError> {
    let item: String = row.try_get("item")?;
    let amount: i64 = row.try_get("amount")?;
    let amount = u32::try_from(amount).map_err(|_| {
        RepositoryError::Decode(format!("cart amount {amount} for `{item}` is out of range"))
    })?;
    Ok(CartLine { item, amount })
}

#[async_trait::async_trait]
impl ContextRepository for SqlContextRepository {
    async fn get(&self, user_id: UserId) -> Result<StoredContext, RepositoryError> {
        let context: Option<String> =
            sqlx::query_scalar("SELECT context FROM user_context WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let rows = sqlx::query("SELECT item, amount FROM cart_item WHERE user_id = ? ORDER BY item")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        let lines = rows.iter().map(row_to_line).collect::<Result<Vec<_>, _>>()?;

        Ok(StoredContext { context: context.unwrap_or_default(), cart: Cart::from_lines(lines) })
    }

    async fn put(&self, user_id: UserId, stored: &StoredContext) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO user_context (user_id, context, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 context = excluded.context,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&stored.context)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM cart_item WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for line in stored.cart.lines() {
            sqlx::query(
                "INSERT INTO cart_item (user_id, item, amount, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(&line.item)
            .bind(i64::from(line.amount))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cart_item WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_context WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
