//! Durable batch buffer.
//!
//! Batches are kept as their serialized JSON so replay posts exactly the bytes
//! that failed. Sequence numbers come from `AUTOINCREMENT` and are never
//! reused, even after the table empties, which keeps replay order stable
//! across restarts.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::clock::Timestamp;

/// A batch awaiting delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedBatch {
    pub seq: i64,
    pub created_at: Timestamp,
    pub payload: String,
}

pub trait BatchStore: Send {
    /// Appends a batch and returns its sequence number.
    fn append(&mut self, payload: &str, created_at: Timestamp) -> Result<i64>;

    /// Oldest batch, if any.
    fn oldest(&mut self) -> Result<Option<BufferedBatch>>;

    /// Removes an acknowledged batch.
    fn remove(&mut self, seq: i64) -> Result<()>;

    fn len(&mut self) -> Result<u64>;

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops the oldest batches until at most `max` remain; returns how many were dropped.
    fn evict_to(&mut self, max: u64) -> Result<u64>;
}

pub struct SqliteBatchStore {
    conn: Connection,
}

impl SqliteBatchStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create buffer directory {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open buffer {}", db_path.display()))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Opens `<buffer_dir>/<camera_id>/batches.db`.
    pub fn open_for_camera(buffer_dir: &Path, camera_id: &str) -> Result<Self> {
        Self::open(&buffer_dir.join(camera_id).join("batches.db"))
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS pending_batches (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl BatchStore for SqliteBatchStore {
    fn append(&mut self, payload: &str, created_at: Timestamp) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pending_batches(created_at, payload_json) VALUES (?1, ?2)",
            params![created_at.as_micros(), payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn oldest(&mut self) -> Result<Option<BufferedBatch>> {
        let row = self
            .conn
            .query_row(
                "SELECT seq, created_at, payload_json FROM pending_batches ORDER BY seq ASC LIMIT 1",
                [],
                |row| {
                    Ok(BufferedBatch {
                        seq: row.get(0)?,
                        created_at: Timestamp::from_micros(row.get(1)?),
                        payload: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn remove(&mut self, seq: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_batches WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_batches", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn evict_to(&mut self, max: u64) -> Result<u64> {
        let len = self.len()?;
        if len <= max {
            return Ok(0);
        }
        let excess = len - max;
        self.conn.execute(
            "DELETE FROM pending_batches WHERE seq IN \
             (SELECT seq FROM pending_batches ORDER BY seq ASC LIMIT ?1)",
            params![excess as i64],
        )?;
        Ok(excess)
    }
}

/// Volatile store for tests and for running without a buffer directory.
#[derive(Default)]
pub struct InMemoryBatchStore {
    batches: VecDeque<BufferedBatch>,
    next_seq: i64,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchStore for InMemoryBatchStore {
    fn append(&mut self, payload: &str, created_at: Timestamp) -> Result<i64> {
        self.next_seq += 1;
        self.batches.push_back(BufferedBatch {
            seq: self.next_seq,
            created_at,
            payload: payload.to_string(),
        });
        Ok(self.next_seq)
    }

    fn oldest(&mut self) -> Result<Option<BufferedBatch>> {
        Ok(self.batches.front().cloned())
    }

    fn remove(&mut self, seq: i64) -> Result<()> {
        self.batches.retain(|b| b.seq != seq);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.batches.len() as u64)
    }

    fn evict_to(&mut self, max: u64) -> Result<u64> {
        let mut evicted = 0;
        while self.batches.len() as u64 > max {
            self.batches.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }
}
