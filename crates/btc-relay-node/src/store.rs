use std::ops::DerefMut;
use std::path::Path;

use async_trait::async_trait;
use bitcoin::BlockHash;
use num_bigint::BigUint;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tokio::fs;

use crate::journal::{GenesisRecord, HeaderJournal};

/// An error that can occur when using the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Genesis header is already stored")]
    GenesisExists,
    #[error("SQLite error: {0}")]
    SQLite(#[from] sqlx::Error),
    #[error("Custom error: {0:?}")]
    Custom(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// SQLite busy timeout in milliseconds
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// SQLite-backed header journal.
/// - WAL mode
/// - Single writer (max_connections = 1)
#[derive(Debug)]
pub struct AppStore {
    pool: Pool<Sqlite>,
}

impl AppStore {
    /// Create a store for a single atomic writer
    pub async fn single_atomic_writer<P: AsRef<Path>>(path: P) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        // Writer pool: single connection ensures single-writer semantics
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    async fn acquire_connection(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    /// Initialize the store by creating the tables if missing
    async fn init(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.acquire_connection().await?;
        // Single row table holding the trusted starting header
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS genesis (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                header BLOB NOT NULL,
                height INTEGER NOT NULL,
                chain_work TEXT NOT NULL,
                epoch_start_time INTEGER NOT NULL
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        // Accepted headers in acceptance order
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS block_headers (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                header BLOB NOT NULL
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HeaderJournal for AppStore {
    async fn load_genesis(&self) -> Result<Option<GenesisRecord>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let row = sqlx::query(
            "SELECT header, height, chain_work, epoch_start_time FROM genesis WHERE id = 0",
        )
        .fetch_optional(conn.deref_mut())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let chain_work: String = row.try_get("chain_work")?;
        let chain_work = chain_work
            .parse::<BigUint>()
            .map_err(|e| StoreError::Custom(Box::new(e)))?;
        Ok(Some(GenesisRecord {
            header: row.try_get("header")?,
            height: row.try_get("height")?,
            chain_work,
            epoch_start_time: row.try_get("epoch_start_time")?,
        }))
    }

    async fn save_genesis(&self, genesis: &GenesisRecord) -> Result<(), StoreError> {
        if self.load_genesis().await?.is_some() {
            return Err(StoreError::GenesisExists);
        }
        let mut conn = self.acquire_connection().await?;
        sqlx::query(
            "INSERT INTO genesis (id, header, height, chain_work, epoch_start_time) VALUES (0, ?, ?, ?, ?)",
        )
        .bind(genesis.header.as_slice())
        .bind(genesis.height)
        .bind(genesis.chain_work.to_string())
        .bind(genesis.epoch_start_time)
        .execute(conn.deref_mut())
        .await?;
        Ok(())
    }

    async fn append_header(&self, hash: &BlockHash, header: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.acquire_connection().await?;
        sqlx::query("INSERT INTO block_headers (hash, header) VALUES (?, ?)")
            .bind(hash.to_string())
            .bind(header)
            .execute(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn load_headers(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let rows = sqlx::query("SELECT header FROM block_headers ORDER BY seq ASC")
            .fetch_all(conn.deref_mut())
            .await?;
        Ok(rows.iter().map(|row| row.get("header")).collect())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use tempfile::TempDir;

    use super::*;

    fn genesis() -> GenesisRecord {
        GenesisRecord {
            header: vec![7u8; 80],
            height: 840_000,
            chain_work: "123456789012345678901234567890".parse().unwrap(),
            epoch_start_time: 1_713_000_000,
        }
    }

    #[tokio::test]
    async fn test_genesis_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = AppStore::single_atomic_writer(dir.path().join("relay.db"))
            .await
            .unwrap();

        assert_eq!(store.load_genesis().await.unwrap(), None);
        store.save_genesis(&genesis()).await.unwrap();
        assert_eq!(store.load_genesis().await.unwrap(), Some(genesis()));
        assert!(matches!(
            store.save_genesis(&genesis()).await,
            Err(StoreError::GenesisExists)
        ));
    }

    #[tokio::test]
    async fn test_headers_kept_in_order_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        {
            let store = AppStore::single_atomic_writer(&path).await.unwrap();
            for i in 0..3u8 {
                let hash = BlockHash::from_byte_array([i; 32]);
                store.append_header(&hash, &[i; 80]).await.unwrap();
            }
            // Hashes are unique
            let hash = BlockHash::from_byte_array([0; 32]);
            assert!(matches!(
                store.append_header(&hash, &[9; 80]).await,
                Err(StoreError::SQLite(_))
            ));
        }

        let store = AppStore::single_atomic_writer(&path).await.unwrap();
        let headers = store.load_headers().await.unwrap();
        assert_eq!(headers, vec![vec![0u8; 80], vec![1u8; 80], vec![2u8; 80]]);
    }
}
