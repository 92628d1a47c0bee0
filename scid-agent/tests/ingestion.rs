mod common;

use common::*;
use scid_agent::backoff::BackoffPolicy;
use scid_agent::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use scid_agent::sink::SqliteSink;
use scid_agent::{
    BatchLimits, IngestError, IngestionLoop, LoopReport, LoopSettings, LoopState, Mode, TickSink,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn batch_settings(max_records: usize) -> LoopSettings {
    LoopSettings {
        mode: Mode::Batch,
        poll_interval: Duration::from_millis(5),
        max_read_bytes: 4096,
        batch: BatchLimits {
            max_records,
            flush_interval: Duration::from_millis(50),
            commit_timeout: Duration::from_secs(10),
        },
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 0.0, 0),
    }
}

async fn ingest_once(
    source: &Path,
    sink: &Arc<SqliteSink>,
    store: Arc<dyn CheckpointStore>,
    max_records: usize,
) -> Result<LoopReport, IngestError> {
    let sink: Arc<dyn TickSink> = sink.clone();
    IngestionLoop::new(
        source,
        sink,
        store,
        batch_settings(max_records),
        CancellationToken::new(),
    )?
    .run()
    .await
}

#[tokio::test]
async fn scenario_three_then_five_records_with_partial_tail() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ESU5.CME.scid");
    std::fs::write(&source, file_with_records(3)).unwrap();
    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let store = Arc::new(SqliteCheckpointStore::new(dir.path().join("checkpoints.db")).unwrap());

    ingest_once(&source, &sink, store.clone(), 1_000).await.unwrap();
    assert_eq!(sink.row_count().await.unwrap(), 3);
    assert_eq!(store.load(&source).await.unwrap().byte_offset, offset_after(3));

    let rows = sink.rows().await.unwrap();
    let keys: Vec<_> = rows.iter().map(|r| r.dedup_key()).collect();
    assert_eq!(
        keys,
        vec![
            (BASE_UNIX_US, "ES", "U5"),
            (BASE_UNIX_US + 1_000_000, "ES", "U5"),
            (BASE_UNIX_US + 2_000_000, "ES", "U5"),
        ]
    );

    let sixth = record(5);
    append(&source, &records(3..5));
    append(&source, &sixth[..7]);
    ingest_once(&source, &sink, store.clone(), 1_000).await.unwrap();
    assert_eq!(sink.row_count().await.unwrap(), 5);
    let checkpoint = store.load(&source).await.unwrap();
    assert_eq!(checkpoint.byte_offset, offset_after(5));
    assert_eq!(checkpoint.record_index, 5);
    assert_eq!(
        std::fs::metadata(&source).unwrap().len(),
        offset_after(5) + 7
    );

    append(&source, &sixth[7..]);
    ingest_once(&source, &sink, store.clone(), 1_000).await.unwrap();
    assert_eq!(sink.row_count().await.unwrap(), 6);
    assert_eq!(store.load(&source).await.unwrap().byte_offset, offset_after(6));
}

#[tokio::test]
async fn ingesting_twice_from_scratch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("NQZ5.CME.scid");
    std::fs::write(&source, file_with_records(25)).unwrap();
    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let store = Arc::new(SqliteCheckpointStore::new(dir.path().join("checkpoints.db")).unwrap());

    ingest_once(&source, &sink, store.clone(), 7).await.unwrap();
    let first = sink.rows().await.unwrap();

    store.reset(&source).await.unwrap();
    let report = ingest_once(&source, &sink, store.clone(), 7).await.unwrap();
    assert_eq!(report.records_committed, 25);
    assert_eq!(sink.rows().await.unwrap(), first);
    assert_eq!(first.len(), 25);
}

#[tokio::test]
async fn crash_between_sink_and_checkpoint_commit_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ESH6.CME.scid");
    std::fs::write(&source, file_with_records(10)).unwrap();

    // Reference: uninterrupted run into its own sink.
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_sink = Arc::new(sqlite_sink(reference_dir.path()).await);
    let reference_store =
        Arc::new(SqliteCheckpointStore::new(reference_dir.path().join("cp.db")).unwrap());
    ingest_once(&source, &reference_sink, reference_store, 4)
        .await
        .unwrap();

    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let mut crashing = ObservedStore::new(&dir.path().join("cp.db"));
    crashing.crash_on_commit = Some(1);
    let crashing = Arc::new(crashing);
    let err = ingest_once(&source, &sink, crashing.clone(), 4)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::CorruptCheckpoint { .. }));
    // Two batches reached the sink, only the first checkpoint was written.
    assert_eq!(sink.row_count().await.unwrap(), 8);
    assert_eq!(crashing.offsets_for(&source), vec![offset_after(4)]);

    let restarted = Arc::new(ObservedStore::new(&dir.path().join("cp.db")));
    ingest_once(&source, &sink, restarted.clone(), 4).await.unwrap();

    assert_eq!(
        sink.rows().await.unwrap(),
        reference_sink.rows().await.unwrap()
    );
    assert_eq!(
        restarted.offsets_for(&source),
        vec![offset_after(8), offset_after(10)]
    );
}

#[tokio::test]
async fn checkpoints_never_regress_across_appends() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("CLF6.NYMEX.scid");
    std::fs::write(&source, header()).unwrap();
    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let store = Arc::new(ObservedStore::new(&dir.path().join("cp.db")));

    for chunk in 0..5u32 {
        append(&source, &records(chunk * 3..chunk * 3 + 3));
        ingest_once(&source, &sink, store.clone(), 2).await.unwrap();
    }

    let offsets = store.offsets_for(&source);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "{offsets:?}");
    assert_eq!(offsets.last().copied(), Some(offset_after(15)));
    assert_eq!(sink.row_count().await.unwrap(), 15);
}

#[tokio::test]
async fn replaced_shorter_file_is_reingested_from_start() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ESU5.CME.scid");
    std::fs::write(&source, file_with_records(6)).unwrap();
    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let store = Arc::new(SqliteCheckpointStore::new(dir.path().join("cp.db")).unwrap());
    ingest_once(&source, &sink, store.clone(), 100).await.unwrap();

    std::fs::write(&source, file_with_records(2)).unwrap();
    let report = ingest_once(&source, &sink, store.clone(), 100).await.unwrap();

    assert_eq!(report.records_committed, 2);
    assert_eq!(store.load(&source).await.unwrap().byte_offset, offset_after(2));
    // Upserts of the same keys leave one row per key.
    assert_eq!(sink.row_count().await.unwrap(), 6);
}

#[tokio::test]
async fn corrupt_header_halts_only_that_source() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("ESU5.CME.scid");
    let good = dir.path().join("ESZ5.CME.scid");
    let mut contents = file_with_records(3);
    contents[8..12].copy_from_slice(&64u32.to_le_bytes());
    std::fs::write(&bad, contents).unwrap();
    std::fs::write(&good, file_with_records(3)).unwrap();

    let sink = Arc::new(sqlite_sink(dir.path()).await);
    let store = Arc::new(SqliteCheckpointStore::new(dir.path().join("cp.db")).unwrap());

    let (bad_result, good_result) = tokio::join!(
        ingest_once(&bad, &sink, store.clone(), 100),
        ingest_once(&good, &sink, store.clone(), 100),
    );
    assert!(matches!(bad_result, Err(IngestError::Format { .. })));
    assert_eq!(good_result.unwrap().state, LoopState::Done);
    assert_eq!(store.load(&bad).await.unwrap().byte_offset, 0);
    assert_eq!(sink.daily_volumes("ES").await.unwrap().len(), 1);
    assert_eq!(sink.row_count().await.unwrap(), 3);
}
