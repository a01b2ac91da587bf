//! Persistent spill-to-disk retry store
//!
//! Bridges the in-memory buffers and a SQLite table so messages survive
//! endpoint outages and restarts. Appends land in `buffer_in` and are
//! flushed to disk in the background once the buffer crosses its
//! threshold; pops drain `buffer_out`, refilled from disk in bulk. All
//! SQLite calls run on the blocking pool, and at most one flush-or-refill
//! operation touches the database at a time, so append and pop are served
//! from memory without contention.
//!
//! Ordering invariant: rows on disk are always older than `buffer_in`,
//! and `buffer_out` is always older than the disk. The shutdown flush
//! re-inserts `buffer_out` below the current minimum id to keep FIFO
//! order across restarts.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::Message;

/// Attempts before a busy error is surfaced
const BUSY_RETRY_ATTEMPTS: u32 = 20;
/// Initial delay between busy retries
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Upper bound for the busy retry delay
const BUSY_RETRY_DELAY_MAX: Duration = Duration::from_millis(500);

/// Eventually-consistent view of where messages currently sit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDepths {
    pub buffer_in: u64,
    pub buffer_out: u64,
    pub disk: u64,
}

/// Disk-backed FIFO used to survive endpoint unavailability
///
/// Cheap to clone; clones share the same buffers and backing table.
#[derive(Clone)]
pub struct RetryStore {
    inner: Arc<Inner>,
}

struct Inner {
    table: String,
    conn: std::sync::Mutex<Connection>,
    buffer_in: Mutex<VecDeque<Message>>,
    buffer_out: Mutex<VecDeque<Message>>,
    /// Cached row count, updated on every flush/refill
    disk_rows: AtomicU64,
    /// Single flush-or-refill guard
    io_busy: AtomicBool,
    /// Vacuum trigger, re-armed whenever rows are written
    vacuum_armed: AtomicBool,
    flush_threshold: usize,
    refill_batch: usize,
}

impl RetryStore {
    /// Open (or create) the backing table.
    ///
    /// A database that cannot be opened or probed is fatal here; transient
    /// busy errors later on are retried internally instead.
    pub async fn open(
        path: impl AsRef<Path>,
        table: &str,
        flush_threshold: usize,
        refill_factor: usize,
    ) -> Result<Self> {
        validate_table_name(table)?;
        let path = path.as_ref().to_owned();
        let table_owned = table.to_string();

        let (conn, rows) = task::spawn_blocking(move || -> Result<(Connection, u64)> {
            let conn = Connection::open(&path)
                .map_err(|e| Error::Storage(format!("Failed to open {}: {e}", path.display())))?;
            conn.busy_timeout(Duration::from_millis(250))
                .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {e}")))?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_owned} (id INTEGER PRIMARY KEY, payload TEXT)"
            ))
            .map_err(|e| Error::Corrupt(format!("Cannot create table {table_owned}: {e}")))?;
            let rows: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table_owned}"), [], |r| r.get(0))
                .map_err(|e| Error::Corrupt(format!("Cannot probe table {table_owned}: {e}")))?;
            Ok((conn, rows as u64))
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {e}")))??;

        debug!(table = %table, rows, "Retry store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                table: table.to_string(),
                conn: std::sync::Mutex::new(conn),
                buffer_in: Mutex::new(VecDeque::new()),
                buffer_out: Mutex::new(VecDeque::new()),
                disk_rows: AtomicU64::new(rows),
                io_busy: AtomicBool::new(false),
                vacuum_armed: AtomicBool::new(true),
                flush_threshold,
                refill_batch: flush_threshold.saturating_mul(refill_factor).max(1),
            }),
        })
    }

    /// Buffer a message for eventual delivery. Never blocks; once
    /// `buffer_in` exceeds the flush threshold a background flush to disk
    /// is scheduled (unless one storage operation is already in flight).
    pub fn append(&self, msg: Message) {
        let len = {
            let mut buf = self.inner.buffer_in.lock();
            buf.push_back(msg);
            buf.len()
        };
        if len > self.inner.flush_threshold {
            self.schedule_flush();
        }
    }

    /// Take the oldest pending message, or `None` when nothing is pending.
    ///
    /// Drains `buffer_out` first, then bulk-refills from disk, then
    /// promotes `buffer_in` directly so the common case never waits on
    /// disk I/O.
    pub async fn pop(&self) -> Result<Option<Message>> {
        if let Some(msg) = self.inner.buffer_out.lock().pop_front() {
            return Ok(Some(msg));
        }

        if self.inner.disk_rows.load(Ordering::Acquire) > 0 {
            self.refill().await?;
            return Ok(self.inner.buffer_out.lock().pop_front());
        }

        // Disk is empty: promote buffer_in in order. Skipped while a flush
        // holds the guard, since that flush owns a prefix of the order.
        if !self.inner.io_busy.load(Ordering::Acquire) {
            let mut buf_in = self.inner.buffer_in.lock();
            let mut buf_out = self.inner.buffer_out.lock();
            buf_out.extend(buf_in.drain(..));
        }
        Ok(self.inner.buffer_out.lock().pop_front())
    }

    /// Eventually-consistent total of messages held anywhere. Informational
    /// only; never drives control flow.
    pub fn qsize(&self) -> u64 {
        let depths = self.depths();
        depths.buffer_in + depths.buffer_out + depths.disk
    }

    pub fn depths(&self) -> StoreDepths {
        StoreDepths {
            buffer_in: self.inner.buffer_in.lock().len() as u64,
            buffer_out: self.inner.buffer_out.lock().len() as u64,
            disk: self.inner.disk_rows.load(Ordering::Acquire),
        }
    }

    /// Drain both buffers to disk. Used at shutdown; a no-op when both
    /// buffers are already empty. Waits for any in-flight background
    /// operation before taking the guard itself.
    pub async fn flush(&self) -> Result<()> {
        while self.inner.io_busy.swap(true, Ordering::AcqRel) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let result = Inner::flush_buffers(&self.inner).await;
        self.inner.io_busy.store(false, Ordering::Release);
        result
    }

    fn schedule_flush(&self) {
        if self.inner.io_busy.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = Inner::background_flush(&inner).await {
                warn!(error = %e, table = %inner.table, "Background flush failed, keeping messages buffered");
            }
            inner.io_busy.store(false, Ordering::Release);
        });
    }

    async fn refill(&self) -> Result<()> {
        // Another flush/refill is running; serve from memory this round.
        if self.inner.io_busy.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = Inner::refill_buffer(&self.inner).await;
        self.inner.io_busy.store(false, Ordering::Release);
        result
    }
}

impl Inner {
    /// Move everything currently in `buffer_in` onto disk.
    /// Caller holds the io guard.
    async fn background_flush(inner: &Arc<Inner>) -> Result<()> {
        let batch: Vec<Message> = {
            let mut buf = inner.buffer_in.lock();
            buf.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let envelopes = encode_batch(&batch)?;
        let count = envelopes.len() as u64;
        let this = inner.clone();
        let result = task::spawn_blocking(move || {
            let conn = this.conn.lock().unwrap_or_else(|p| p.into_inner());
            with_busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO {} (payload) VALUES (?1)",
                        this.table
                    ))?;
                    for envelope in &envelopes {
                        stmt.execute([envelope])?;
                    }
                }
                tx.commit()
            })
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {e}")))?;

        match result {
            Ok(()) => {
                inner.disk_rows.fetch_add(count, Ordering::AcqRel);
                inner.vacuum_armed.store(true, Ordering::Release);
                debug!(table = %inner.table, count, "Flushed buffer to disk");
                Ok(())
            }
            Err(e) => {
                // Put the batch back in front so order is kept for the retry.
                let mut buf = inner.buffer_in.lock();
                for msg in batch.into_iter().rev() {
                    buf.push_front(msg);
                }
                Err(e)
            }
        }
    }

    /// Pull a batch of the oldest rows into `buffer_out`, deleting them in
    /// the same transaction. Caller holds the io guard.
    async fn refill_buffer(inner: &Arc<Inner>) -> Result<()> {
        let this = inner.clone();
        let batch_size = inner.refill_batch;
        let (rows, remaining) = task::spawn_blocking(move || {
            let conn = this.conn.lock().unwrap_or_else(|p| p.into_inner());
            with_busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                let mut rows: Vec<String> = Vec::new();
                let mut last_id: i64 = i64::MIN;
                {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT id, payload FROM {} ORDER BY id ASC LIMIT ?1",
                        this.table
                    ))?;
                    let mut query = stmt.query([batch_size as i64])?;
                    while let Some(row) = query.next()? {
                        last_id = row.get(0)?;
                        rows.push(row.get(1)?);
                    }
                }
                if !rows.is_empty() {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE id <= ?1", this.table),
                        [last_id],
                    )?;
                }
                tx.commit()?;
                let remaining: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", this.table), [], |r| {
                        r.get(0)
                    })?;
                Ok((rows, remaining as u64))
            })
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {e}")))??;

        let count = rows.len();
        {
            let mut buf = inner.buffer_out.lock();
            for raw in &rows {
                match Message::from_envelope(raw) {
                    Ok(msg) => buf.push_back(msg),
                    Err(e) => warn!(error = %e, table = %inner.table, "Dropping undecodable spill row"),
                }
            }
        }
        inner.disk_rows.store(remaining, Ordering::Release);
        debug!(table = %inner.table, count, remaining, "Refilled buffer from disk");

        if remaining == 0 && inner.vacuum_armed.swap(false, Ordering::AcqRel) {
            Inner::vacuum(inner).await;
        }
        Ok(())
    }

    /// Reclaim file space once the table is empty. Failures only re-arm
    /// the trigger.
    async fn vacuum(inner: &Arc<Inner>) {
        let this = inner.clone();
        let result = task::spawn_blocking(move || {
            let conn = this.conn.lock().unwrap_or_else(|p| p.into_inner());
            conn.execute_batch("VACUUM")
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(table = %inner.table, "Vacuumed retry store"),
            Ok(Err(e)) => {
                warn!(error = %e, table = %inner.table, "Vacuum failed, re-arming");
                inner.vacuum_armed.store(true, Ordering::Release);
            }
            Err(e) => {
                warn!(error = %e, table = %inner.table, "Vacuum task failed, re-arming");
                inner.vacuum_armed.store(true, Ordering::Release);
            }
        }
    }

    /// Persist both buffers. `buffer_out` rows predate what is on disk, so
    /// they are written below the current minimum id; `buffer_in` rows are
    /// the newest and are appended. Caller holds the io guard.
    async fn flush_buffers(inner: &Arc<Inner>) -> Result<()> {
        let out_batch: Vec<Message> = {
            let mut buf = inner.buffer_out.lock();
            buf.drain(..).collect()
        };
        let in_batch: Vec<Message> = {
            let mut buf = inner.buffer_in.lock();
            buf.drain(..).collect()
        };
        if out_batch.is_empty() && in_batch.is_empty() {
            return Ok(());
        }

        let out_envelopes = encode_batch(&out_batch)?;
        let in_envelopes = encode_batch(&in_batch)?;
        let this = inner.clone();
        let result = task::spawn_blocking(move || {
            let conn = this.conn.lock().unwrap_or_else(|p| p.into_inner());
            with_busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                if !out_envelopes.is_empty() {
                    let min_id: i64 = tx.query_row(
                        &format!("SELECT COALESCE(MIN(id), 1) FROM {}", this.table),
                        [],
                        |r| r.get(0),
                    )?;
                    let base = min_id - out_envelopes.len() as i64;
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO {} (id, payload) VALUES (?1, ?2)",
                        this.table
                    ))?;
                    for (i, envelope) in out_envelopes.iter().enumerate() {
                        stmt.execute(rusqlite::params![base + i as i64, envelope])?;
                    }
                }
                if !in_envelopes.is_empty() {
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO {} (payload) VALUES (?1)",
                        this.table
                    ))?;
                    for envelope in &in_envelopes {
                        stmt.execute([envelope])?;
                    }
                }
                tx.commit()?;
                let rows: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", this.table), [], |r| {
                        r.get(0)
                    })?;
                Ok(rows as u64)
            })
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {e}")))?;

        match result {
            Ok(rows) => {
                inner.disk_rows.store(rows, Ordering::Release);
                inner.vacuum_armed.store(true, Ordering::Release);
                debug!(table = %inner.table, rows, "Flushed buffers for shutdown");
                Ok(())
            }
            Err(e) => {
                // Restore both buffers so nothing is lost in memory.
                {
                    let mut buf = inner.buffer_out.lock();
                    for msg in out_batch.into_iter().rev() {
                        buf.push_front(msg);
                    }
                }
                {
                    let mut buf = inner.buffer_in.lock();
                    for msg in in_batch.into_iter().rev() {
                        buf.push_front(msg);
                    }
                }
                Err(e)
            }
        }
    }
}

fn encode_batch(batch: &[Message]) -> Result<Vec<String>> {
    batch.iter().map(Message::to_envelope).collect()
}

/// Retry a storage operation while SQLite reports lock contention.
fn with_busy_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut delay = BUSY_RETRY_DELAY;
    for attempt in 1..=BUSY_RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) => {
                if attempt == BUSY_RETRY_ATTEMPTS {
                    return Err(Error::StorageBusy(e.to_string()));
                }
                std::thread::sleep(delay);
                delay = (delay * 2).min(BUSY_RETRY_DELAY_MAX);
            }
            Err(e) => return Err(Error::Storage(e.to_string())),
        }
    }
    Err(Error::StorageBusy("retry budget exhausted".to_string()))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "Invalid store table name: {table:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir, threshold: usize) -> RetryStore {
        RetryStore::open(dir.path().join("retry.db"), "retry_out", threshold, 10)
            .await
            .unwrap()
    }

    fn msg(p: &str) -> Message {
        Message::new(p)
    }

    #[tokio::test]
    async fn test_append_pop_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1000).await;

        store.append(msg("A"));
        store.append(msg("B"));
        store.append(msg("C"));

        assert_eq!(store.pop().await.unwrap().unwrap().payload, "A");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "B");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "C");
        assert!(store.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_threshold_flush_drains_buffer_in() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1000).await;

        for n in 0..1500 {
            store.append(msg(&format!("m{n}")));
        }
        // The background flush fires on its own once the threshold is
        // crossed; wait for it rather than forcing one.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.depths().buffer_in > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("background flush did not drain buffer_in");

        let depths = store.depths();
        assert_eq!(depths.buffer_in, 0);
        assert_eq!(store.qsize(), 1500);
        assert_eq!(depths.disk, 1500);
    }

    #[tokio::test]
    async fn test_fifo_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir, 1000).await;
            for p in ["A", "B", "C", "D", "E"] {
                store.append(msg(p));
            }
            store.flush().await.unwrap();
        }

        let store = open_store(&dir, 1000).await;
        for expected in ["A", "B", "C", "D", "E"] {
            assert_eq!(store.pop().await.unwrap().unwrap().payload, expected);
        }
        assert!(store.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_drains_before_fresh_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1000).await;

        store.append(msg("old1"));
        store.append(msg("old2"));
        store.flush().await.unwrap();
        store.append(msg("new1"));

        assert_eq!(store.pop().await.unwrap().unwrap().payload, "old1");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "old2");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "new1");
    }

    #[tokio::test]
    async fn test_flush_restores_buffer_out_below_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir, 1000).await;
            for p in ["A", "B", "C"] {
                store.append(msg(p));
            }
            store.flush().await.unwrap();

            // Refill pulls everything into buffer_out; deliver only "A".
            assert_eq!(store.pop().await.unwrap().unwrap().payload, "A");
            store.append(msg("D"));
            store.flush().await.unwrap();
        }

        // After restart the undelivered remainder comes back in order.
        let store = open_store(&dir, 1000).await;
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "B");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "C");
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "D");
        assert!(store.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_on_empty_store_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1000).await;

        store.flush().await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.qsize(), 0);
    }

    #[tokio::test]
    async fn test_qsize_counts_all_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 1000).await;

        store.append(msg("a"));
        store.append(msg("b"));
        store.flush().await.unwrap();
        store.append(msg("c"));

        assert_eq!(store.qsize(), 3);
        let depths = store.depths();
        assert_eq!(depths.disk, 2);
        assert_eq!(depths.buffer_in, 1);
    }

    #[tokio::test]
    async fn test_separate_tables_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry.db");
        let outbound = RetryStore::open(&path, "retry_out", 1000, 10).await.unwrap();
        let inbound = RetryStore::open(&path, "retry_in", 1000, 10).await.unwrap();

        outbound.append(msg("out"));
        inbound.append(msg("in"));
        outbound.flush().await.unwrap();
        inbound.flush().await.unwrap();

        assert_eq!(outbound.pop().await.unwrap().unwrap().payload, "out");
        assert!(outbound.pop().await.unwrap().is_none());
        assert_eq!(inbound.pop().await.unwrap().unwrap().payload, "in");
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            RetryStore::open(dir.path().join("retry.db"), "bad; DROP TABLE x", 1000, 10).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_refill_batch_leaves_remainder_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        // Threshold 2 gives a refill batch of 20.
        let store = open_store(&dir, 2).await;
        for n in 0..30 {
            store.append(msg(&format!("m{n}")));
        }
        store.flush().await.unwrap();
        assert_eq!(store.depths().disk, 30);

        // First pop refills one batch; the rest stays on disk.
        assert_eq!(store.pop().await.unwrap().unwrap().payload, "m0");
        let depths = store.depths();
        assert_eq!(depths.buffer_out, 19);
        assert_eq!(depths.disk, 10);

        for n in 1..30 {
            assert_eq!(store.pop().await.unwrap().unwrap().payload, format!("m{n}"));
        }
        assert!(store.pop().await.unwrap().is_none());
    }
}
