use anyhow::Result;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, Connection, Pool, Postgres, Row};
use std::time::Duration;

use crate::types::conversions::{address_to_string, string_to_address};
use crate::types::{PoolRecord, TokenInfo};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "price_feed";

/// Persistent, deduplicated catalog of validated pools.
#[async_trait]
pub trait PoolCatalog: Send + Sync {
    /// Inserts `record` unless a row for `(chain_id, address)` exists. Returns whether a row was
    /// written; an existing row is not an error.
    async fn insert_pool_if_absent(&self, record: &PoolRecord) -> Result<bool>;

    /// Every pool stored for `chain_id`.
    async fn load_pools(&self, chain_id: u64) -> Result<Vec<PoolRecord>>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid catalog row {address}: {reason}")]
    InvalidRow { address: String, reason: String },
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    // Force UTF-8 client encoding to avoid sqlx issues with non-ASCII server messages
    std::env::set_var("PGCLIENTENCODING", "UTF8");

    // Retry with exponential backoff to survive DNS/startup races in Compose
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "Connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped at 12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x5052_4943_4546_4544; // "PRICEFED"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.pools (
            id SERIAL PRIMARY KEY,
            chain_id BIGINT NOT NULL,
            address VARCHAR(42) NOT NULL,
            token0_address VARCHAR(42) NOT NULL,
            token0_symbol TEXT NOT NULL,
            token0_name TEXT NOT NULL,
            token0_decimals SMALLINT NOT NULL,
            token1_address VARCHAR(42) NOT NULL,
            token1_symbol TEXT NOT NULL,
            token1_name TEXT NOT NULL,
            token1_decimals SMALLINT NOT NULL,
            fee INTEGER,
            quote TEXT NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            UNIQUE (chain_id, address)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_pools_chain ON {}.pools(chain_id)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    log::info!("Database schema ready.");
    Ok(())
}

fn token_from_row(row: &PgRow, side: &str, pool: &str) -> Result<TokenInfo> {
    let invalid = |reason: String| CatalogError::InvalidRow {
        address: pool.to_string(),
        reason,
    };
    let address: String = row.try_get(format!("{}_address", side).as_str())?;
    let decimals: i16 = row.try_get(format!("{}_decimals", side).as_str())?;
    Ok(TokenInfo {
        address: string_to_address(&address).map_err(|e| invalid(e.to_string()))?,
        symbol: row.try_get(format!("{}_symbol", side).as_str())?,
        name: row.try_get(format!("{}_name", side).as_str())?,
        decimals: u8::try_from(decimals)
            .map_err(|_| invalid(format!("{} decimals {}", side, decimals)))?,
    })
}

fn record_from_row(row: &PgRow) -> Result<PoolRecord> {
    let address: String = row.try_get("address")?;
    let chain_id: i64 = row.try_get("chain_id")?;
    let fee: Option<i32> = row.try_get("fee")?;
    Ok(PoolRecord {
        chain_id: chain_id as u64,
        address: string_to_address(&address).map_err(|e| CatalogError::InvalidRow {
            address: address.clone(),
            reason: e.to_string(),
        })?,
        token0: token_from_row(row, "token0", &address)?,
        token1: token_from_row(row, "token1", &address)?,
        fee: fee.map(|f| f as u32),
    })
}

/// [`PoolCatalog`] backed by the `price_feed.pools` table.
#[derive(Clone)]
pub struct PgPoolCatalog {
    pool: DbPool,
}

impl PgPoolCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoolCatalog for PgPoolCatalog {
    async fn insert_pool_if_absent(&self, record: &PoolRecord) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {}.pools (chain_id, address,
                token0_address, token0_symbol, token0_name, token0_decimals,
                token1_address, token1_symbol, token1_name, token1_decimals,
                fee, quote)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (chain_id, address) DO NOTHING",
            SCHEMA
        ))
        .bind(record.chain_id as i64)
        .bind(address_to_string(record.address))
        .bind(address_to_string(record.token0.address))
        .bind(&record.token0.symbol)
        .bind(&record.token0.name)
        .bind(record.token0.decimals as i16)
        .bind(address_to_string(record.token1.address))
        .bind(&record.token1.symbol)
        .bind(&record.token1.name)
        .bind(record.token1.decimals as i16)
        .bind(record.fee.map(|f| f as i32))
        .bind(record.quote())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_pools(&self, chain_id: u64) -> Result<Vec<PoolRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT chain_id, address,
                token0_address, token0_symbol, token0_name, token0_decimals,
                token1_address, token1_symbol, token1_name, token1_decimals,
                fee
             FROM {}.pools WHERE chain_id = $1 ORDER BY id",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match record_from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping catalog row: {}", e),
            }
        }
        Ok(records)
    }
}

/// Process-local catalog, used when no database is configured.
#[derive(Default)]
pub struct MemoryPoolCatalog {
    rows: std::sync::Mutex<indexmap::IndexMap<(u64, ethers::types::Address), PoolRecord>>,
}

impl MemoryPoolCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolCatalog for MemoryPoolCatalog {
    async fn insert_pool_if_absent(&self, record: &PoolRecord) -> Result<bool> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("catalog lock poisoned"))?;
        let key = (record.chain_id, record.address);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, record.clone());
        Ok(true)
    }

    async fn load_pools(&self, chain_id: u64) -> Result<Vec<PoolRecord>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| anyhow::anyhow!("catalog lock poisoned"))?;
        Ok(rows
            .iter()
            .filter(|((chain, _), _)| *chain == chain_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn record(chain_id: u64, byte: u8) -> PoolRecord {
        let token = TokenInfo {
            address: Address::repeat_byte(byte),
            symbol: "TKN".into(),
            name: "Token".into(),
            decimals: 18,
        };
        let weth = TokenInfo {
            address: Address::repeat_byte(0xee),
            symbol: "WETH".into(),
            name: "Wrapped Ether".into(),
            decimals: 18,
        };
        PoolRecord::new(chain_id, Address::repeat_byte(byte + 1), token, weth, None)
    }

    #[tokio::test]
    async fn test_memory_catalog_insert_is_idempotent_per_chain() {
        let catalog = MemoryPoolCatalog::new();
        assert!(catalog.insert_pool_if_absent(&record(1, 0x10)).await.unwrap());
        assert!(!catalog.insert_pool_if_absent(&record(1, 0x10)).await.unwrap());
        assert!(catalog.insert_pool_if_absent(&record(5, 0x10)).await.unwrap());
        assert!(catalog.insert_pool_if_absent(&record(1, 0x20)).await.unwrap());

        let mainnet = catalog.load_pools(1).await.unwrap();
        assert_eq!(mainnet.len(), 2);
        assert_eq!(mainnet[0].address, Address::repeat_byte(0x11));
        assert_eq!(catalog.load_pools(5).await.unwrap().len(), 1);
    }
}
