// =============================================================================
// Tick History Queries — read path over persisted day files
// =============================================================================
//
// Serves `GET /api/history/ticks`.  Each query opens the requested day file
// read-only; a missing file is an empty result, not an error.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

use crate::market_data::Tick;
use crate::persistence::writer::day_file_path;

/// Page of persisted ticks for one (symbol, day).
#[derive(Debug, Clone, Serialize)]
pub struct TickPage {
    pub symbol: String,
    pub date: NaiveDate,
    pub ticks: Vec<Tick>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Query a page of ticks ordered by timestamp.
pub fn query_ticks(
    data_dir: &Path,
    symbol: &str,
    date: NaiveDate,
    limit: u64,
    offset: u64,
) -> Result<TickPage> {
    let path = day_file_path(data_dir, date);
    if !path.exists() {
        return Ok(TickPage {
            symbol: symbol.to_string(),
            date,
            ticks: Vec::new(),
            total: 0,
            offset,
            limit,
        });
    }

    let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open tick db {}", path.display()))?;

    let total: u64 = conn
        .query_row(
            "SELECT COUNT(*) FROM ticks WHERE symbol = ?1",
            params![symbol],
            |row| row.get::<_, i64>(0),
        )
        .context("tick count query failed")? as u64;

    let mut stmt = conn
        .prepare(
            "SELECT symbol, timestamp, bid, ask, spread FROM ticks \
             WHERE symbol = ?1 ORDER BY timestamp ASC LIMIT ?2 OFFSET ?3",
        )
        .context("failed to prepare tick page query")?;

    let rows = stmt
        .query_map(params![symbol, limit as i64, offset as i64], |row| {
            Ok(Tick {
                symbol: row.get(0)?,
                timestamp_ns: row.get(1)?,
                bid: row.get(2)?,
                ask: row.get(3)?,
                spread: row.get(4)?,
                // Sequence numbers are an in-memory ordering aid and are not
                // persisted.
                sequence: 0,
            })
        })
        .context("tick page query failed")?;

    let mut ticks = Vec::new();
    for row in rows {
        ticks.push(row.context("tick row decode failed")?);
    }

    Ok(TickPage {
        symbol: symbol.to_string(),
        date,
        ticks,
        total,
        offset,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TickWriter;

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

    #[test]
    fn pages_come_back_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();

        let (mut writer, _handle) = TickWriter::new(dir.path(), 64, 500, 30);
        // Batch out of order; the page query orders by timestamp.
        for ts in [30, 10, 20, 50, 40] {
            writer.push_for_test(tick("EURUSD", ts, 1.10));
        }
        writer.push_for_test(tick("GBPUSD", 15, 1.25));
        writer.flush(day);

        let page = query_ticks(dir.path(), "EURUSD", day, 3, 1).unwrap();
        assert_eq!(page.total, 5);
        let stamps: Vec<i64> = page.ticks.iter().map(|t| t.timestamp_ns).collect();
        assert_eq!(stamps, vec![20, 30, 40]);
    }

    #[test]
    fn missing_day_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 4, 2).unwrap();
        let page = query_ticks(dir.path(), "EURUSD", day, 100, 0).unwrap();
        assert_eq!(page.total, 0);
        assert!(page.ticks.is_empty());
    }
}
