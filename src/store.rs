//! Observation store
//!
//! Durable log of connection observations backing the in-memory registry.
//! Only read in bulk at startup (registry rebuild) and pruned by the sweep
//! task; the live path is append-only.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::net::IpAddr;
use std::str::FromStr;

use crate::wire::ConnectionEvent;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// One row replayed from the store: the newest sighting of an
/// (account, ip, port) triple.
#[derive(Debug, Clone)]
pub struct StoredObservation {
    pub account: String,
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub seen_at: i64,
}

#[derive(Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
}

impl ObservationStore {
    /// Open (creating if missing) the SQLite file and apply migrations.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests; single connection so the database is shared.
    pub async fn memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Append a batch of events inside one transaction.
    pub async fn append_batch(&self, events: &[ConnectionEvent]) -> Result<(), sqlx::Error> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for ev in events {
            sqlx::query(
                "INSERT INTO observations (account, ip, port, node, seen_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&ev.account_id)
            .bind(ev.source_ip.to_string())
            .bind(ev.source_port.map(|p| p as i64))
            .bind(&ev.node_id)
            .bind(ev.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Newest sighting of every (account, ip, port) triple seen after
    /// `cutoff`. Rows with an address that no longer parses are dropped with
    /// a warning rather than failing the whole replay.
    pub async fn load_recent(&self, cutoff: i64) -> Result<Vec<StoredObservation>, sqlx::Error> {
        let rows: Vec<(String, String, Option<i64>, i64)> = sqlx::query_as(
            "SELECT account, ip, port, MAX(seen_at) FROM observations \
             WHERE seen_at > ? GROUP BY account, ip, port",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (account, ip, port, seen_at) in rows {
            let Ok(ip) = ip.parse::<IpAddr>() else {
                tracing::warn!("[store] [bad_row] account={} ip={}", account, ip);
                continue;
            };
            out.push(StoredObservation {
                account,
                ip,
                port: port.and_then(|p| u16::try_from(p).ok()),
                seen_at,
            });
        }
        Ok(out)
    }

    /// Delete observations older than `cutoff`. Returns the number of rows
    /// removed.
    pub async fn prune(&self, cutoff: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM observations WHERE seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
