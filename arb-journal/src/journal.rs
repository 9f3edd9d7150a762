use crate::error::JournalError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

const RETRY_FOREVER_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveTransactionRow {
    pub id: Uuid,
    pub state: serde_json::Value,
    pub from_currency: String,
    pub from_amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UnfilledMarketRow {
    pub market: String,
    pub side: String,
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderIdRow {
    pub market: String,
    pub side: String,
    pub order_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlacklistedMarketRow {
    pub market: String,
    pub reason: String,
    pub ttl_sec: i64,
    pub blacklisted_at: DateTime<Utc>,
}

/// Postgres-backed durability journal. Every in-flight transaction intent is upserted here on
/// each state transition so a crash can resume the exact in-progress set rather than replan from
/// scratch, and every completed one is appended to an audit log. `unfilled_markets`/`order_ids`/
/// `blacklisted_markets` back the equivalent engine-side caches so they too survive a restart.
#[derive(Clone)]
pub struct Journal {
    pool: PgPool,
}

impl Journal {
    pub async fn connect(database_url: &str) -> Result<Self, JournalError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), JournalError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // --- active_transactions -------------------------------------------------------------

    pub async fn upsert_active_transaction(
        &self,
        id: Uuid,
        state: &serde_json::Value,
        from_currency: &str,
        from_amount: Decimal,
    ) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO active_transactions (id, state, from_currency, from_amount, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                from_currency = EXCLUDED.from_currency,
                from_amount = EXCLUDED.from_amount,
                updated_at = now()
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(from_currency)
        .bind(from_amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_active_transaction(&self, id: Uuid) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM active_transactions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every in-flight transaction, read once at startup to resume or replan each one.
    pub async fn list_active_transactions(&self) -> Result<Vec<ActiveTransactionRow>, JournalError> {
        let rows = sqlx::query_as::<_, ActiveTransactionRow>(
            "SELECT id, state, from_currency, from_amount, updated_at FROM active_transactions ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Sum of `from_amount` across every active transaction currently reserving `currency`, for
    /// balance-in-use accounting. Indexed on `from_currency` so this never deserializes `state`.
    pub async fn reserved_amount(&self, currency: &str) -> Result<Decimal, JournalError> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(from_amount) FROM active_transactions WHERE from_currency = $1",
        )
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    /// Atomically move a transaction from `active_transactions` to `completed_transactions`. Runs
    /// inside a single `REPEATABLE READ` transaction so a crash mid-write never leaves the engine
    /// observing the intent as both active and completed.
    pub async fn complete_transaction(
        &self,
        id: Uuid,
        state: &serde_json::Value,
        profit: Decimal,
    ) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO completed_transactions (id, state, profit, completed_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, profit = EXCLUDED.profit
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(profit)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM active_transactions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Same as [`Self::complete_transaction`] but shielded from the caller's own cancellation:
    /// the write runs on a detached task and is retried forever on transient failure, so dropping
    /// the returned future (eg/ a shutdown timeout) can never lose a transaction's final state.
    pub fn complete_transaction_non_cancellable(
        &self,
        id: Uuid,
        state: serde_json::Value,
        profit: Decimal,
    ) {
        let journal = self.clone();
        tokio::spawn(async move {
            loop {
                match journal.complete_transaction(id, &state, profit).await {
                    Ok(()) => return,
                    Err(err) => {
                        error!(%id, ?err, "failed to persist completed transaction, retrying");
                        tokio::time::sleep(RETRY_FOREVER_BACKOFF).await;
                    }
                }
            }
        });
    }

    // --- unfilled_markets ------------------------------------------------------------------

    /// Add `amount` to whatever is already pooled for `(market, side)`.
    pub async fn add_unfilled_amount(
        &self,
        market: &str,
        side: &str,
        amount: Decimal,
    ) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO unfilled_markets (market, side, amount, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (market, side)
            DO UPDATE SET amount = unfilled_markets.amount + EXCLUDED.amount, updated_at = now()
            "#,
        )
        .bind(market)
        .bind(side)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically read and zero out the pooled amount for `(market, side)`, returning whatever was
    /// there. Used when a new path is about to start through that market/side and wants to absorb
    /// any previously-stranded remainder.
    pub async fn take_unfilled_amount(&self, market: &str, side: &str) -> Result<Decimal, JournalError> {
        let mut tx = self.pool.begin().await?;

        let amount: Option<Decimal> = sqlx::query_scalar(
            "SELECT amount FROM unfilled_markets WHERE market = $1 AND side = $2 FOR UPDATE",
        )
        .bind(market)
        .bind(side)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(amount) = amount else {
            tx.commit().await?;
            return Ok(Decimal::ZERO);
        };

        sqlx::query("DELETE FROM unfilled_markets WHERE market = $1 AND side = $2")
            .bind(market)
            .bind(side)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(amount)
    }

    pub async fn list_unfilled_markets(&self) -> Result<Vec<UnfilledMarketRow>, JournalError> {
        let rows = sqlx::query_as::<_, UnfilledMarketRow>(
            "SELECT market, side, amount, updated_at FROM unfilled_markets",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- order_ids -----------------------------------------------------------------------

    pub async fn set_order_id(&self, market: &str, side: &str, order_id: &str) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO order_ids (market, side, order_id, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (market, side) DO UPDATE SET order_id = EXCLUDED.order_id, updated_at = now()
            "#,
        )
        .bind(market)
        .bind(side)
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_order_id(&self, market: &str, side: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM order_ids WHERE market = $1 AND side = $2")
            .bind(market)
            .bind(side)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every resting order left over from a previous run, read once at startup so
    /// `POWER_ON_RECOVERY` knows what to cancel and replay.
    pub async fn list_order_ids(&self) -> Result<Vec<OrderIdRow>, JournalError> {
        let rows = sqlx::query_as::<_, OrderIdRow>(
            "SELECT market, side, order_id, updated_at FROM order_ids",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- blacklisted_markets ---------------------------------------------------------------

    pub async fn blacklist_market(&self, market: &str, reason: &str, ttl_sec: i64) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            INSERT INTO blacklisted_markets (market, reason, ttl_sec, blacklisted_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (market)
            DO UPDATE SET reason = EXCLUDED.reason, ttl_sec = EXCLUDED.ttl_sec, blacklisted_at = now()
            "#,
        )
        .bind(market)
        .bind(reason)
        .bind(ttl_sec)
        .execute(&self.pool)
        .await?;
        warn!(market, reason, ttl_sec, "market blacklisted");
        Ok(())
    }

    pub async fn unblacklist_market(&self, market: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM blacklisted_markets WHERE market = $1")
            .bind(market)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `true` if `market` is blacklisted and its TTL has not yet elapsed.
    pub async fn is_blacklisted(&self, market: &str) -> Result<bool, JournalError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT market FROM blacklisted_markets
             WHERE market = $1 AND blacklisted_at + (ttl_sec * interval '1 second') > now()",
        )
        .bind(market)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn list_blacklisted_markets(&self) -> Result<Vec<BlacklistedMarketRow>, JournalError> {
        let rows = sqlx::query_as::<_, BlacklistedMarketRow>(
            "SELECT market, reason, ttl_sec, blacklisted_at FROM blacklisted_markets",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete every row whose TTL has elapsed, returning how many were reaped. Run periodically
    /// by the engine's blacklist sweep task so the table does not grow unbounded with stale rows
    /// that `is_blacklisted` would already treat as expired.
    pub async fn sweep_expired_blacklist(&self) -> Result<u64, JournalError> {
        let result = sqlx::query(
            "DELETE FROM blacklisted_markets WHERE blacklisted_at + (ttl_sec * interval '1 second') <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_is_bounded_and_nonzero() {
        assert!(RETRY_FOREVER_BACKOFF.as_secs() > 0);
    }
}
