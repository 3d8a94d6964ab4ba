// =============================================================================
// Persistence Writer — batched, non-blocking tick storage with daily rotation
// =============================================================================
//
// Ingestion enqueues tick copies through a bounded channel with `try_send`;
// when the queue is full the tick is dropped from persistence (the in-memory
// ring still holds it) and a counter is bumped.  A dedicated writer task
// drains the queue into an in-memory batch and commits the batch as a single
// transaction when it reaches `batch_size` or the periodic flush fires.
//
// Storage is one SQLite file per UTC day in WAL mode:
//
//     <data_dir>/ticks/db/<YYYY>/<MM>/ticks_<YYYY-MM-DD>.db
//
// Durability is best-effort: a failed batch is logged and discarded, a corrupt
// file is renamed `.bad` and a fresh one opened.  The ring buffer remains the
// source of truth for recent data.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::market_data::Tick;

/// Pragmas applied to every freshly opened day file.
const DB_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ticks (
    symbol    TEXT    NOT NULL,
    timestamp INTEGER NOT NULL,
    bid       REAL    NOT NULL,
    ask       REAL    NOT NULL,
    spread    REAL    NOT NULL,
    PRIMARY KEY (symbol, timestamp)
) WITHOUT ROWID;
"#;

/// Path of the active day file for `date`.
pub fn day_file_path(data_dir: &Path, date: NaiveDate) -> PathBuf {
    data_dir
        .join("ticks")
        .join("db")
        .join(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(format!("ticks_{}.db", date.format("%Y-%m-%d")))
}

fn open_day_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create tick db directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open tick db {}", path.display()))?;
    conn.execute_batch(DB_PRAGMAS)
        .context("failed to apply tick db pragmas")?;
    conn.execute_batch(SCHEMA_SQL)
        .context("failed to create ticks table")?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Handle (ingestion side)
// ---------------------------------------------------------------------------

/// Cheap clonable handle used by the ingestion path.
#[derive(Clone)]
pub struct TickWriterHandle {
    tx: mpsc::Sender<Tick>,
    dropped: Arc<AtomicU64>,
}

impl TickWriterHandle {
    /// Queue a tick copy for persistence. Never blocks; a full queue drops the
    /// tick and bumps the drop counter.
    pub fn enqueue(&self, tick: &Tick) {
        if self.tx.try_send(tick.clone()).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!(dropped, "persistence queue full, dropping ticks");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

struct ActiveDb {
    date: NaiveDate,
    path: PathBuf,
    conn: Connection,
}

/// Owns the active day file and the write loop.
pub struct TickWriter {
    rx: mpsc::Receiver<Tick>,
    data_dir: PathBuf,
    batch_size: usize,
    flush_secs: u64,
    batch: Vec<Tick>,
    active: Option<ActiveDb>,
    batches_written: u64,
    batches_failed: u64,
}

impl TickWriter {
    /// Build the writer plus its ingestion handle.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        queue_capacity: usize,
        batch_size: usize,
        flush_secs: u64,
    ) -> (Self, TickWriterHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = TickWriterHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let writer = Self {
            rx,
            data_dir: data_dir.into(),
            batch_size,
            flush_secs,
            batch: Vec::with_capacity(batch_size),
            active: None,
            batches_written: 0,
            batches_failed: 0,
        };
        (writer, handle)
    }

    /// Drive the write loop until shutdown. The current batch is flushed
    /// before exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut flush_timer =
            tokio::time::interval(tokio::time::Duration::from_secs(self.flush_secs.max(1)));
        // The first tick of a tokio interval fires immediately; skip it.
        flush_timer.tick().await;

        info!(
            data_dir = %self.data_dir.display(),
            batch_size = self.batch_size,
            flush_secs = self.flush_secs,
            "persistence writer started"
        );

        loop {
            tokio::select! {
                maybe_tick = self.rx.recv() => {
                    match maybe_tick {
                        Some(tick) => {
                            self.batch.push(tick);
                            if self.batch.len() >= self.batch_size {
                                self.flush(Utc::now().date_naive());
                            }
                        }
                        None => {
                            // All senders gone; final flush and exit.
                            self.flush(Utc::now().date_naive());
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    self.flush(Utc::now().date_naive());
                }
                _ = shutdown.changed() => {
                    self.flush(Utc::now().date_naive());
                    info!(
                        batches_written = self.batches_written,
                        batches_failed = self.batches_failed,
                        "persistence writer stopped"
                    );
                    break;
                }
            }
        }
    }

    /// Commit the in-memory batch for the given UTC day, rotating the active
    /// file across midnight. Visible for tests, which drive rotation by
    /// passing explicit dates.
    pub fn flush(&mut self, today: NaiveDate) {
        if self.batch.is_empty() {
            return;
        }

        if let Err(e) = self.ensure_active(today) {
            error!(error = %e, "failed to open tick day file, discarding batch");
            self.batch.clear();
            self.batches_failed += 1;
            return;
        }

        let result = self.write_batch();
        match result {
            Ok(written) => {
                self.batches_written += 1;
                debug!(written, "tick batch committed");
            }
            Err(e) => {
                self.batches_failed += 1;
                error!(error = %e, discarded = self.batch.len(), "tick batch write failed, discarding");
                self.quarantine_if_corrupt(&e);
            }
        }
        self.batch.clear();
    }

    fn ensure_active(&mut self, today: NaiveDate) -> Result<()> {
        let rotate = match &self.active {
            Some(active) => active.date != today,
            None => true,
        };
        if rotate {
            if let Some(old) = self.active.take() {
                info!(closed = %old.path.display(), "rotating tick day file");
            }
            let path = day_file_path(&self.data_dir, today);
            let conn = open_day_db(&path)?;
            info!(path = %path.display(), "tick day file opened");
            self.active = Some(ActiveDb {
                date: today,
                path,
                conn,
            });
        }
        Ok(())
    }

    fn write_batch(&mut self) -> Result<usize> {
        let active = self
            .active
            .as_mut()
            .context("no active tick day file")?;

        let tx = active
            .conn
            .transaction()
            .context("failed to begin tick batch transaction")?;
        {
            // (symbol, timestamp) uniqueness dedupes replays from reconnects.
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO ticks (symbol, timestamp, bid, ask, spread) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("failed to prepare tick insert")?;
            for tick in &self.batch {
                stmt.execute(params![
                    tick.symbol,
                    tick.timestamp_ns,
                    tick.bid,
                    tick.ask,
                    tick.spread
                ])
                .context("tick insert failed")?;
            }
        }
        tx.commit().context("tick batch commit failed")?;
        Ok(self.batch.len())
    }

    /// If the error smells like file corruption, move the file aside so the
    /// next flush starts a fresh one.
    fn quarantine_if_corrupt(&mut self, err: &anyhow::Error) {
        let corrupt = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseCorrupt
                        || e.code == rusqlite::ErrorCode::NotADatabase
            )
        });
        if !corrupt {
            return;
        }
        if let Some(active) = self.active.take() {
            let bad = active.path.with_extension("db.bad");
            drop(active.conn);
            if let Err(e) = std::fs::rename(&active.path, &bad) {
                error!(error = %e, path = %active.path.display(), "failed to quarantine corrupt tick db");
            } else {
                warn!(path = %bad.display(), "corrupt tick db quarantined");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn push_for_test(&mut self, tick: Tick) {
        self.batch.push(tick);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ts_ns: i64, bid: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            bid,
            ask: bid + 0.0002,
            spread: 0.0002,
            timestamp_ns: ts_ns,
            sequence: 0,
        }
    }

    fn count_rows(path: &Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn batch_commits_to_day_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _handle) = TickWriter::new(dir.path(), 16, 500, 30);

        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        for i in 0..10 {
            writer.push_for_test(tick("EURUSD", i * 1_000, 1.10 + i as f64 * 0.001));
        }
        writer.flush(day);

        let path = day_file_path(dir.path(), day);
        assert!(path.exists());
        assert_eq!(count_rows(&path), 10);
    }

    #[test]
    fn duplicate_symbol_timestamp_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _handle) = TickWriter::new(dir.path(), 16, 500, 30);

        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        writer.push_for_test(tick("EURUSD", 42, 1.10));
        writer.push_for_test(tick("EURUSD", 42, 1.20));
        writer.flush(day);

        assert_eq!(count_rows(&day_file_path(dir.path(), day)), 1);
    }

    #[test]
    fn midnight_rotation_creates_two_day_files() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _handle) = TickWriter::new(dir.path(), 16, 500, 30);

        let day1 = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        writer.push_for_test(tick("EURUSD", 1, 1.10));
        writer.flush(day1);
        writer.push_for_test(tick("EURUSD", 2, 1.11));
        writer.flush(day2);

        let f1 = day_file_path(dir.path(), day1);
        let f2 = day_file_path(dir.path(), day2);
        assert!(f1.exists() && f2.exists());
        assert_eq!(count_rows(&f1), 1);
        assert_eq!(count_rows(&f2), 1);
    }

    #[test]
    fn enqueue_drops_when_queue_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, handle) = TickWriter::new(dir.path(), 2, 500, 30);

        for i in 0..5 {
            handle.enqueue(&tick("EURUSD", i, 1.10));
        }
        // Capacity 2, nothing draining: three ticks must have been dropped.
        assert_eq!(handle.dropped(), 3);
    }

    #[test]
    fn empty_flush_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _handle) = TickWriter::new(dir.path(), 16, 500, 30);
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        writer.flush(day);
        assert!(!day_file_path(dir.path(), day).exists());
    }
}
