//! PostgreSQL swap ledger

use super::api::SwapLedger;
use super::types::{
    AddressListing, BigValueRelease, IntentStatus, MatchStatus, MatchUpdate, SwapDirection,
    SwapIntent, SwapKey, SwapMatch,
};
use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const MATCH_COLUMNS: &str = "direction, txid, pair_id, bind, height, deposit_time, \
     from_address, to_address, value, swap_tx, old_swap_txs, old_swap_vals, swap_height, \
     swap_time, swap_value, swap_type, swap_nonce, status, updated_at";

/// Swap ledger persisted in PostgreSQL
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connect to the database
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_intents (
                direction VARCHAR(8) NOT NULL,
                txid VARCHAR(128) NOT NULL,
                pair_id VARCHAR(64) NOT NULL,
                bind VARCHAR(128) NOT NULL,
                tx_type VARCHAR(16) NOT NULL,
                status VARCHAR(32) NOT NULL,
                init_time TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                memo TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (direction, txid, pair_id, bind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status
            ON swap_intents (direction, status, init_time)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_matches (
                direction VARCHAR(8) NOT NULL,
                txid VARCHAR(128) NOT NULL,
                pair_id VARCHAR(64) NOT NULL,
                bind VARCHAR(128) NOT NULL,
                height BIGINT NOT NULL,
                deposit_time TIMESTAMPTZ NOT NULL,
                from_address VARCHAR(128) NOT NULL,
                to_address VARCHAR(128) NOT NULL,
                value TEXT NOT NULL,
                swap_tx VARCHAR(128) NOT NULL DEFAULT '',
                old_swap_txs TEXT[] NOT NULL DEFAULT '{}',
                old_swap_vals TEXT[] NOT NULL DEFAULT '{}',
                swap_height BIGINT NOT NULL DEFAULT 0,
                swap_time TIMESTAMPTZ,
                swap_value TEXT NOT NULL DEFAULT '0',
                swap_type VARCHAR(8) NOT NULL,
                swap_nonce BIGINT,
                status VARCHAR(16) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (direction, txid, pair_id, bind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_matches_status
            ON swap_matches (direction, status, deposit_time)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS big_value_releases (
                direction VARCHAR(8) NOT NULL,
                txid VARCHAR(128) NOT NULL,
                pair_id VARCHAR(64) NOT NULL,
                bind VARCHAR(128) NOT NULL,
                approved_by VARCHAR(64) NOT NULL,
                approved_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (direction, txid, pair_id, bind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS address_listings (
                address VARCHAR(128) PRIMARY KEY,
                listing VARCHAR(8) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Disambiguate an update that touched no rows
    async fn explain_missed_update(&self, key: &SwapKey, nonce: Option<u64>) -> SwapError {
        match self.find_match(key).await {
            Ok(Some(existing)) => match (existing.swap_nonce, nonce) {
                (Some(have), Some(got)) => SwapError::NonceAlreadyReserved {
                    key: key.to_string(),
                    have,
                    got,
                },
                _ => SwapError::Internal(format!("update of {} affected no rows", key)),
            },
            Ok(None) => SwapError::RecordNotFound {
                key: key.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> SwapResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(SwapError::Internal)
}

fn parse_amount(raw: &str) -> SwapResult<u128> {
    raw.parse::<u128>()
        .map_err(|e| SwapError::Internal(format!("invalid amount {}: {}", raw, e)))
}

fn key_from_row(row: &PgRow) -> SwapResult<SwapKey> {
    Ok(SwapKey {
        direction: parse_column(row, "direction")?,
        txid: row.try_get("txid")?,
        pair_id: row.try_get("pair_id")?,
        bind: row.try_get("bind")?,
    })
}

fn intent_from_row(row: &PgRow) -> SwapResult<SwapIntent> {
    Ok(SwapIntent {
        key: key_from_row(row)?,
        tx_type: parse_column(row, "tx_type")?,
        status: parse_column(row, "status")?,
        init_time: row.try_get("init_time")?,
        timestamp: row.try_get("updated_at")?,
        memo: row.try_get("memo")?,
    })
}

fn match_from_row(row: &PgRow) -> SwapResult<SwapMatch> {
    let value: String = row.try_get("value")?;
    let swap_value: String = row.try_get("swap_value")?;
    let old_swap_vals: Vec<String> = row.try_get("old_swap_vals")?;
    let swap_nonce: Option<i64> = row.try_get("swap_nonce")?;

    Ok(SwapMatch {
        key: key_from_row(row)?,
        height: row.try_get::<i64, _>("height")? as u64,
        time: row.try_get("deposit_time")?,
        from: row.try_get("from_address")?,
        to: row.try_get("to_address")?,
        value: parse_amount(&value)?,
        swap_tx: row.try_get("swap_tx")?,
        old_swap_txs: row.try_get("old_swap_txs")?,
        old_swap_vals: old_swap_vals
            .iter()
            .map(|v| parse_amount(v))
            .collect::<SwapResult<_>>()?,
        swap_height: row.try_get::<i64, _>("swap_height")? as u64,
        swap_time: row.try_get("swap_time")?,
        swap_value: parse_amount(&swap_value)?,
        swap_type: parse_column(row, "swap_type")?,
        swap_nonce: swap_nonce.map(|n| n as u64),
        status: parse_column(row, "status")?,
        timestamp: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SwapLedger for PgLedger {
    async fn add_intent(&self, intent: &SwapIntent) -> SwapResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO swap_intents
                (direction, txid, pair_id, bind, tx_type, status, init_time, updated_at, memo)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (direction, txid, pair_id, bind) DO NOTHING
            "#,
        )
        .bind(intent.key.direction.as_str())
        .bind(&intent.key.txid)
        .bind(&intent.key.pair_id)
        .bind(&intent.key.bind)
        .bind(intent.tx_type.as_str())
        .bind(intent.status.as_str())
        .bind(intent.init_time)
        .bind(intent.timestamp)
        .bind(&intent.memo)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_intent(&self, key: &SwapKey) -> SwapResult<Option<SwapIntent>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM swap_intents
            WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4
            "#,
        )
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn find_intents_by_status(
        &self,
        direction: SwapDirection,
        status: IntentStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapIntent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM swap_intents
            WHERE direction = $1 AND status = $2 AND init_time >= $3
            ORDER BY init_time
            "#,
        )
        .bind(direction.as_str())
        .bind(status.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(intent_from_row).collect()
    }

    async fn update_intent_status(
        &self,
        key: &SwapKey,
        status: IntentStatus,
        timestamp: DateTime<Utc>,
        memo: &str,
    ) -> SwapResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE swap_intents
            SET status = $5, updated_at = $6, memo = $7
            WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4
            "#,
        )
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .bind(status.as_str())
        .bind(timestamp)
        .bind(memo)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SwapError::RecordNotFound {
                key: key.to_string(),
            });
        }
        debug!("Intent {} -> {}", key, status);
        Ok(())
    }

    async fn add_match(&self, swap: &SwapMatch) -> SwapResult<bool> {
        let old_vals: Vec<String> = swap.old_swap_vals.iter().map(|v| v.to_string()).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO swap_matches
                (direction, txid, pair_id, bind, height, deposit_time, from_address, to_address,
                 value, swap_tx, old_swap_txs, old_swap_vals, swap_height, swap_time, swap_value,
                 swap_type, swap_nonce, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19)
            ON CONFLICT (direction, txid, pair_id, bind) DO NOTHING
            "#,
        )
        .bind(swap.key.direction.as_str())
        .bind(&swap.key.txid)
        .bind(&swap.key.pair_id)
        .bind(&swap.key.bind)
        .bind(swap.height as i64)
        .bind(swap.time)
        .bind(&swap.from)
        .bind(&swap.to)
        .bind(swap.value.to_string())
        .bind(&swap.swap_tx)
        .bind(&swap.old_swap_txs)
        .bind(&old_vals)
        .bind(swap.swap_height as i64)
        .bind(swap.swap_time)
        .bind(swap.swap_value.to_string())
        .bind(swap.swap_type.as_str())
        .bind(swap.swap_nonce.map(|n| n as i64))
        .bind(swap.status.as_str())
        .bind(swap.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_match(&self, key: &SwapKey) -> SwapResult<Option<SwapMatch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM swap_matches \
             WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4",
            MATCH_COLUMNS
        ))
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(match_from_row).transpose()
    }

    async fn find_matches_by_status(
        &self,
        direction: SwapDirection,
        status: MatchStatus,
        since: DateTime<Utc>,
    ) -> SwapResult<Vec<SwapMatch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM swap_matches \
             WHERE direction = $1 AND status = $2 AND deposit_time >= $3 \
             ORDER BY deposit_time",
            MATCH_COLUMNS
        ))
        .bind(direction.as_str())
        .bind(status.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(match_from_row).collect()
    }

    async fn update_match(
        &self,
        key: &SwapKey,
        update: &MatchUpdate,
        timestamp: DateTime<Utc>,
    ) -> SwapResult<()> {
        let nonce = update.swap_nonce.map(|n| n as i64);
        let result = sqlx::query(
            r#"
            UPDATE swap_matches SET
                status = COALESCE($5, status),
                swap_tx = COALESCE($6, swap_tx),
                old_swap_txs = CASE WHEN $7::TEXT IS NULL THEN old_swap_txs
                                    ELSE array_append(old_swap_txs, $7::TEXT) END,
                old_swap_vals = CASE WHEN $8::TEXT IS NULL THEN old_swap_vals
                                     ELSE array_append(old_swap_vals, $8::TEXT) END,
                swap_height = COALESCE($9, swap_height),
                swap_time = COALESCE($10, swap_time),
                swap_value = COALESCE($11, swap_value),
                swap_type = COALESCE($12, swap_type),
                swap_nonce = COALESCE(swap_nonce, $13),
                updated_at = $14
            WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4
              AND ($13::BIGINT IS NULL OR swap_nonce IS NULL OR swap_nonce = $13)
            "#,
        )
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.swap_tx.as_deref())
        .bind(update.push_old_swap.as_ref().map(|o| o.tx_hash.clone()))
        .bind(update.push_old_swap.as_ref().map(|o| o.value.to_string()))
        .bind(update.swap_height.map(|h| h as i64))
        .bind(update.swap_time)
        .bind(update.swap_value.map(|v| v.to_string()))
        .bind(update.swap_type.map(|t| t.as_str()))
        .bind(nonce)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(key, update.swap_nonce).await);
        }
        Ok(())
    }

    async fn reset_match(&self, key: &SwapKey, timestamp: DateTime<Utc>) -> SwapResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE swap_matches SET
                old_swap_txs = CASE WHEN swap_tx = '' THEN old_swap_txs
                                    ELSE array_append(old_swap_txs, swap_tx) END,
                old_swap_vals = CASE WHEN swap_tx = '' THEN old_swap_vals
                                     ELSE array_append(old_swap_vals, swap_value) END,
                status = $5, swap_tx = '', swap_height = 0, swap_time = NULL,
                swap_value = '0', swap_nonce = NULL, updated_at = $6
            WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4
            "#,
        )
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .bind(MatchStatus::Empty.as_str())
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SwapError::RecordNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn find_history(
        &self,
        direction: SwapDirection,
        address: &str,
        limit: usize,
    ) -> SwapResult<Vec<SwapMatch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM swap_matches \
             WHERE direction = $1 AND (lower(bind) = lower($2) OR lower(from_address) = lower($2)) \
             ORDER BY deposit_time DESC LIMIT $3",
            MATCH_COLUMNS
        ))
        .bind(direction.as_str())
        .bind(address)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(match_from_row).collect()
    }

    async fn count_intents(&self) -> SwapResult<Vec<(IntentStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM swap_intents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let status: IntentStatus = parse_column(row, "status")?;
                let total: i64 = row.try_get("total")?;
                Ok((status, total as u64))
            })
            .collect()
    }

    async fn add_big_value_release(&self, release: &BigValueRelease) -> SwapResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO big_value_releases
                (direction, txid, pair_id, bind, approved_by, approved_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (direction, txid, pair_id, bind) DO NOTHING
            "#,
        )
        .bind(release.key.direction.as_str())
        .bind(&release.key.txid)
        .bind(&release.key.pair_id)
        .bind(&release.key.bind)
        .bind(&release.approved_by)
        .bind(release.approved_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_big_value_release(
        &self,
        key: &SwapKey,
    ) -> SwapResult<Option<BigValueRelease>> {
        let row = sqlx::query(
            r#"
            SELECT approved_by, approved_at FROM big_value_releases
            WHERE direction = $1 AND txid = $2 AND pair_id = $3 AND bind = $4
            "#,
        )
        .bind(key.direction.as_str())
        .bind(&key.txid)
        .bind(&key.pair_id)
        .bind(&key.bind)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(BigValueRelease {
                key: key.clone(),
                approved_by: r.try_get("approved_by")?,
                approved_at: r.try_get("approved_at")?,
            })
        })
        .transpose()
    }

    async fn set_address_listing(
        &self,
        address: &str,
        listing: AddressListing,
        timestamp: DateTime<Utc>,
    ) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO address_listings (address, listing, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (address)
            DO UPDATE SET listing = $2, updated_at = $3
            "#,
        )
        .bind(address)
        .bind(listing.as_str())
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_address_listing(&self, address: &str) -> SwapResult<Option<AddressListing>> {
        let row = sqlx::query("SELECT listing FROM address_listings WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(|r| parse_column::<AddressListing>(r, "listing"))
            .transpose()
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
