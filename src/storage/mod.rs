use std::collections::HashMap;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::Result;
use crate::types::{Market, OrderbookSnapshot, PriceSnapshot, Resolution, Trade};

/// Rows per bulk INSERT statement. Keeps bind counts well under the
/// Postgres 65535 parameter limit at our widest row (6 binds).
const BULK_CHUNK_ROWS: usize = 1000;

/// Write path and read accessors over the shared connection pool. One
/// instance is shared by every collector and the trade drain task;
/// concurrency safety is the database's per-statement atomicity, not locks.
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // -- markets ------------------------------------------------------------

    /// Idempotent upsert keyed by condition_id. Refreshes all mutable fields
    /// and bumps updated_at.
    pub async fn upsert_market(&self, market: &Market) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO markets (condition_id, question, outcomes, clob_token_ids, active, closed, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (condition_id) DO UPDATE SET
                question = EXCLUDED.question,
                outcomes = EXCLUDED.outcomes,
                clob_token_ids = EXCLUDED.clob_token_ids,
                active = EXCLUDED.active,
                closed = EXCLUDED.closed,
                end_date = EXCLUDED.end_date,
                updated_at = NOW()
            "#,
        )
        .bind(&market.condition_id)
        .bind(&market.question)
        .bind(&market.outcomes)
        .bind(&market.clob_token_ids)
        .bind(market.active)
        .bind(market.closed)
        .bind(market.end_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_active_markets(&self, limit: i64) -> Result<Vec<Market>> {
        let rows = sqlx::query(
            r#"
            SELECT condition_id, question, outcomes, clob_token_ids, active, closed, end_date
            FROM markets
            WHERE active AND NOT closed
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_market).collect()
    }

    /// Markets that have closed but have no resolution row yet.
    pub async fn get_unresolved_closed_markets(&self, limit: i64) -> Result<Vec<Market>> {
        let rows = sqlx::query(
            r#"
            SELECT m.condition_id, m.question, m.outcomes, m.clob_token_ids, m.active, m.closed, m.end_date
            FROM markets m
            WHERE m.closed
              AND NOT EXISTS (SELECT 1 FROM resolutions r WHERE r.condition_id = m.condition_id)
            ORDER BY m.updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_market).collect()
    }

    // -- time series --------------------------------------------------------

    pub async fn bulk_insert_price_snapshots(&self, rows: &[PriceSnapshot]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO price_snapshots (ts, token_id, price, volume_24h) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.token_id)
                    .push_bind(row.price)
                    .push_bind(row.volume_24h);
            });
            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn bulk_insert_orderbook_snapshots(&self, rows: &[OrderbookSnapshot]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO orderbook_snapshots (ts, token_id, bids, asks, spread, midpoint) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.token_id)
                    .push_bind(Json(&row.bids))
                    .push_bind(Json(&row.asks))
                    .push_bind(row.spread)
                    .push_bind(row.midpoint);
            });
            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    /// Rows carrying a trade_id deduplicate on (trade_id, ts); stream-sourced
    /// rows (trade_id NULL) always insert.
    pub async fn bulk_insert_trades(&self, rows: &[Trade]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO trades (ts, token_id, side, price, size, trade_id) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(&row.token_id)
                    .push_bind(row.side.to_string())
                    .push_bind(row.price)
                    .push_bind(row.size)
                    .push_bind(&row.trade_id);
            });
            qb.push(" ON CONFLICT (trade_id, ts) WHERE trade_id IS NOT NULL DO NOTHING");
            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    // -- resolutions --------------------------------------------------------

    /// Write-once: a second upsert for the same condition_id is a no-op.
    /// Returns true if the row was actually inserted.
    pub async fn upsert_resolution(&self, resolution: &Resolution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO resolutions (condition_id, outcome, winner_token_id, resolved_at, payout_price, detection_method)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (condition_id) DO NOTHING
            "#,
        )
        .bind(&resolution.condition_id)
        .bind(&resolution.outcome)
        .bind(&resolution.winner_token_id)
        .bind(resolution.resolved_at)
        .bind(resolution.payout_price)
        .bind(&resolution.detection_method)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Latest stored price per token, for resolution inference.
    pub async fn get_latest_prices(&self, token_ids: &[String]) -> Result<HashMap<String, f64>> {
        if token_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (token_id) token_id, price
            FROM price_snapshots
            WHERE token_id = ANY($1)
            ORDER BY token_id, ts DESC
            "#,
        )
        .bind(token_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut prices = HashMap::with_capacity(rows.len());
        for row in rows {
            prices.insert(row.try_get("token_id")?, row.try_get("price")?);
        }
        Ok(prices)
    }
}

fn row_to_market(row: &PgRow) -> Result<Market> {
    Ok(Market {
        condition_id: row.try_get("condition_id")?,
        question: row.try_get("question")?,
        outcomes: row.try_get("outcomes")?,
        clob_token_ids: row.try_get("clob_token_ids")?,
        active: row.try_get("active")?,
        closed: row.try_get("closed")?,
        end_date: row.try_get("end_date")?,
    })
}
