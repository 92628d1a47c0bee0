use super::{validate_table_name, TickSink};
use crate::error::SinkError;
use crate::format::TickRecord;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Local SQLite table with the same dedup key as the QuestDB schema.
///
/// `front_contract` is created with the table but never written by upserts; the
/// downstream front-contract job owns it.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    path: Arc<PathBuf>,
    table: Arc<str>,
}

/// Sum of volume per trading day and contract period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyVolume {
    pub day: String,
    pub symbol_period: String,
    pub volume: u64,
}

impl SqliteSink {
    pub fn new(path: impl AsRef<Path>, table: &str) -> Result<Self, SinkError> {
        validate_table_name(table)?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                SinkError::Transient(format!(
                    "failed to create sink directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path: Arc::new(path),
            table: Arc::from(table),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let db_path = self.path.clone();
        let table = self.table.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            op(&mut conn, &table)
        })
        .await
        .map_err(|err| SinkError::Transient(format!("sink task join error: {err}")))?
        .map_err(classify)
    }

    /// Number of rows currently stored.
    pub async fn row_count(&self) -> Result<u64, SinkError> {
        self.with_connection(|conn, table| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as u64)
        })
        .await
    }

    /// All rows ordered by dedup key.
    pub async fn rows(&self) -> Result<Vec<TickRecord>, SinkError> {
        self.with_connection(|conn, table| {
            let mut stmt = conn.prepare(&format!(
                "
                SELECT time, open, high, low, close, volume, number_of_trades,
                       bid_volume, ask_volume, symbol, symbol_period
                FROM {table}
                ORDER BY time, symbol, symbol_period
                "
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok(TickRecord {
                    timestamp_us: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                    number_of_trades: row.get(6)?,
                    bid_volume: row.get(7)?,
                    ask_volume: row.get(8)?,
                    symbol: row.get(9)?,
                    symbol_period: row.get(10)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Daily volume per contract period for `symbol`, the input of front-contract selection.
    pub async fn daily_volumes(&self, symbol: &str) -> Result<Vec<DailyVolume>, SinkError> {
        let symbol = symbol.to_string();
        self.with_connection(move |conn, table| {
            let mut stmt = conn.prepare(&format!(
                "
                SELECT date(time / 1000000, 'unixepoch') AS day,
                       symbol_period,
                       SUM(volume)
                FROM {table}
                WHERE symbol = ?1
                GROUP BY day, symbol_period
                ORDER BY day, symbol_period
                "
            ))?;
            let rows = stmt.query_map(params![symbol], |row| {
                Ok(DailyVolume {
                    day: row.get(0)?,
                    symbol_period: row.get(1)?,
                    volume: row.get::<_, i64>(2)? as u64,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl TickSink for SqliteSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.with_connection(|conn, table| {
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS {table} (
                    time INTEGER NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume INTEGER NOT NULL,
                    number_of_trades INTEGER NOT NULL,
                    bid_volume INTEGER NOT NULL,
                    ask_volume INTEGER NOT NULL,
                    symbol TEXT NOT NULL CHECK (symbol <> ''),
                    symbol_period TEXT NOT NULL,
                    front_contract INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (time, symbol, symbol_period)
                );
                "
            ))
        })
        .await
    }

    async fn upsert_batch(&self, records: &[TickRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let records = records.to_vec();
        let count = records.len();
        self.with_connection(move |conn, table| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "
                    INSERT INTO {table} (
                        time, open, high, low, close, volume, number_of_trades,
                        bid_volume, ask_volume, symbol, symbol_period
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    ON CONFLICT(time, symbol, symbol_period) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume,
                        number_of_trades = excluded.number_of_trades,
                        bid_volume = excluded.bid_volume,
                        ask_volume = excluded.ask_volume
                    "
                ))?;
                for record in &records {
                    stmt.execute(params![
                        record.timestamp_us,
                        record.open,
                        record.high,
                        record.low,
                        record.close,
                        record.volume,
                        record.number_of_trades,
                        record.bid_volume,
                        record.ask_volume,
                        record.symbol,
                        record.symbol_period,
                    ])?;
                }
            }
            tx.commit()
        })
        .await?;

        debug!(record_count = count, table = %self.table, "upserted batch into sqlite sink");
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn classify(err: rusqlite::Error) -> SinkError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => SinkError::Rejected(err.to_string()),
        _ => SinkError::Transient(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, period: &str, volume: u32) -> TickRecord {
        TickRecord {
            timestamp_us: ts,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume,
            number_of_trades: 1,
            bid_volume: volume / 2,
            ask_volume: volume - volume / 2,
            symbol: "ES".into(),
            symbol_period: period.into(),
        }
    }

    async fn sink() -> (tempfile::TempDir, SqliteSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::new(dir.path().join("sink.db"), "trades").unwrap();
        sink.ensure_schema().await.unwrap();
        (dir, sink)
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let (_dir, sink) = sink().await;
        sink.ensure_schema().await.unwrap();
        assert_eq!(sink.row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_upsert_keeps_one_row_per_key() {
        let (_dir, sink) = sink().await;
        let batch = vec![tick(1, "U5", 3), tick(2, "U5", 4)];
        sink.upsert_batch(&batch).await.unwrap();
        sink.upsert_batch(&batch).await.unwrap();

        assert_eq!(sink.row_count().await.unwrap(), 2);
        assert_eq!(sink.rows().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn same_timestamp_different_period_is_a_distinct_row() {
        let (_dir, sink) = sink().await;
        sink.upsert_batch(&[tick(1, "U5", 3), tick(1, "Z5", 3)])
            .await
            .unwrap();
        assert_eq!(sink.row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_batch_commits_nothing() {
        let (_dir, sink) = sink().await;
        let mut bad = tick(3, "U5", 1);
        bad.symbol.clear();
        let err = sink
            .upsert_batch(&[tick(1, "U5", 1), tick(2, "U5", 1), bad])
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Rejected(_)));
        assert_eq!(sink.row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_preserves_front_contract_flag() {
        let (dir, sink) = sink().await;
        sink.upsert_batch(&[tick(1, "U5", 3)]).await.unwrap();
        let conn = Connection::open(dir.path().join("sink.db")).unwrap();
        conn.execute("UPDATE trades SET front_contract = 1", [])
            .unwrap();

        sink.upsert_batch(&[tick(1, "U5", 3)]).await.unwrap();
        let flag: i64 = conn
            .query_row("SELECT front_contract FROM trades", [], |row| row.get(0))
            .unwrap();
        assert_eq!(flag, 1);
    }

    #[tokio::test]
    async fn daily_volumes_group_by_day_and_period() {
        let (_dir, sink) = sink().await;
        let day1 = 1_704_153_600_000_000; // 2024-01-02
        let day2 = day1 + 86_400_000_000;
        sink.upsert_batch(&[
            tick(day1, "H4", 5),
            tick(day1 + 1, "H4", 7),
            tick(day1 + 2, "M4", 2),
            tick(day2, "M4", 9),
        ])
        .await
        .unwrap();

        let volumes = sink.daily_volumes("ES").await.unwrap();
        assert_eq!(
            volumes,
            vec![
                DailyVolume {
                    day: "2024-01-02".into(),
                    symbol_period: "H4".into(),
                    volume: 12
                },
                DailyVolume {
                    day: "2024-01-02".into(),
                    symbol_period: "M4".into(),
                    volume: 2
                },
                DailyVolume {
                    day: "2024-01-03".into(),
                    symbol_period: "M4".into(),
                    volume: 9
                },
            ]
        );
    }
}
