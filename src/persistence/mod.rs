//! SQLite-backed key-value state store.
//!
//! Holds the authoritative portfolio state, persistence counters, pair
//! records, and cycle summaries as JSON values, written atomically in a
//! single transaction per cycle. A lease-based row lock keeps a second
//! process from running cycles against the same store.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Well-known store keys.
pub mod keys {
    pub const PORTFOLIO: &str = "portfolio/state";
    pub const COUNTERS: &str = "persistence/counters";

    pub fn pair(pair_id: &str) -> String {
        format!("pairs/{pair_id}")
    }

    pub fn cycle_summary(cycle_id: u64) -> String {
        format!("cycles/{cycle_id}/summary")
    }
}

/// A batch of writes applied in one transaction.
#[derive(Debug, Default)]
pub struct StateBatch {
    entries: Vec<(String, String)>,
    deletes: Vec<String>,
}

impl StateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<&mut Self> {
        let json = serde_json::to_string(value).context("Failed to serialize state value")?;
        self.entries.push((key.into(), json));
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.deletes.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.deletes.len()
    }
}

/// Key-value store over SQLite.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open state store at {:?}", path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;
        info!("State store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Cross-process instance lock (singleton row)
            CREATE TABLE IF NOT EXISTS instance_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )?;
        debug!("State store schema initialized");
        Ok(())
    }

    /// Read and deserialize one value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        match json {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt state value under key {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// List keys under a prefix, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv WHERE key LIKE ?1 || '%' ORDER BY key")?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Apply all writes and deletes of the batch in one transaction.
    pub fn apply(&self, batch: &StateBatch) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        for (key, value) in &batch.entries {
            tx.execute(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
                "#,
                params![key, value, now],
            )?;
        }
        for key in &batch.deletes {
            tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        }

        tx.commit()?;
        debug!(writes = batch.len(), "State batch committed");
        Ok(())
    }

    // ==================== Instance lock ====================

    /// Try to take the instance lock. Succeeds when the lock is free,
    /// expired, or already held by the same owner.
    pub fn acquire_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let current: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT owner, expires_at FROM instance_lock WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((holder, expires_at)) = current {
            let expired = DateTime::parse_from_rfc3339(&expires_at)
                .map(|t| t.with_timezone(&Utc) <= now)
                .unwrap_or(true);
            if holder != owner && !expired {
                warn!(%holder, "Instance lock held by another process");
                return Ok(false);
            }
        }

        self.conn.execute(
            r#"
            INSERT INTO instance_lock (id, owner, expires_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET owner = ?1, expires_at = ?2
            "#,
            params![owner, (now + ttl).to_rfc3339()],
        )?;
        debug!(%owner, "Instance lock acquired");
        Ok(true)
    }

    /// Extend the lease; fails when the lock moved to another owner.
    pub fn renew_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE instance_lock SET expires_at = ?2 WHERE id = 1 AND owner = ?1",
            params![owner, (Utc::now() + ttl).to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    /// Release the lock if still held by this owner.
    pub fn release_lock(&self, owner: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM instance_lock WHERE id = 1 AND owner = ?1",
            [owner],
        )?;
        debug!(%owner, "Instance lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{PortfolioState, RiskStatus};
    use rust_decimal_macros::dec;

    #[test]
    fn test_portfolio_state_round_trips_through_store() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = PortfolioState::new(dec!(1000));
        state.risk_status = RiskStatus::Reduce;
        state.last_cycle_id = 5;

        let mut batch = StateBatch::new();
        batch.put(keys::PORTFOLIO, &state).unwrap();
        store.apply(&batch).unwrap();

        let restored: PortfolioState = store.get(keys::PORTFOLIO).unwrap().unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = StateStore::open_in_memory().unwrap();
        let value: Option<PortfolioState> = store.get(keys::PORTFOLIO).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_batch_writes_and_deletes() {
        let store = StateStore::open_in_memory().unwrap();

        let mut batch = StateBatch::new();
        batch.put(keys::pair("p1"), &"a".to_string()).unwrap();
        batch.put(keys::pair("p2"), &"b".to_string()).unwrap();
        store.apply(&batch).unwrap();

        let mut batch = StateBatch::new();
        batch.delete(keys::pair("p1"));
        batch.put(keys::pair("p3"), &"c".to_string()).unwrap();
        store.apply(&batch).unwrap();

        assert_eq!(
            store.keys_with_prefix("pairs/").unwrap(),
            vec!["pairs/p2".to_string(), "pairs/p3".to_string()]
        );
    }

    #[test]
    fn test_lock_conflict_and_reentry() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.acquire_lock("a", Duration::seconds(60)).unwrap());
        assert!(!store.acquire_lock("b", Duration::seconds(60)).unwrap());
        // Same owner may re-acquire
        assert!(store.acquire_lock("a", Duration::seconds(60)).unwrap());
    }

    #[test]
    fn test_expired_lock_is_stealable() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.acquire_lock("a", Duration::seconds(0)).unwrap());
        assert!(store.acquire_lock("b", Duration::seconds(60)).unwrap());
        // The old owner can no longer renew
        assert!(!store.renew_lock("a", Duration::seconds(60)).unwrap());
    }

    #[test]
    fn test_release_frees_lock() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.acquire_lock("a", Duration::seconds(60)).unwrap());
        store.release_lock("a").unwrap();
        assert!(store.acquire_lock("b", Duration::seconds(60)).unwrap());
    }
}
