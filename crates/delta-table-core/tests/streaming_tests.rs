//! Streaming source scenarios: backfill, tailing, admission control,
//! offset bumps, and per-version hygiene.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashMap;

use common::*;
use delta_table_core::runtime::LocalRuntime;
use delta_table_core::schema::PrimitiveType;
use delta_table_core::streaming::{
    AdmissionLimits, MicroBatch, StartingPosition, StreamError, StreamOptions,
};
use delta_table_core::transaction_log::Version;

fn limits(max_files: usize) -> AdmissionLimits {
    AdmissionLimits {
        max_files: Some(max_files),
        max_bytes: None,
    }
}

fn positions(batch: &MicroBatch) -> Vec<(Version, i64)> {
    batch.files.iter().map(|f| (f.version, f.index)).collect()
}

/// Backfill an initial snapshot of five files in two-file batches, then
/// tail a later commit. Mirrors the offset bump at the end of a version.
#[tokio::test]
async fn backfill_then_tail_with_admission_control() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    // Five files across two commits (3 + 2).
    for _ in 0..3 {
        table
            .append(&runtime, rows_of(&["k"], vec![vec![long(1)]]))
            .await?;
    }
    // Versions so far: 0 (create), 1..=3 (appends). Add two more files in
    // two commits to reach five.
    for _ in 0..2 {
        table
            .append(&runtime, rows_of(&["k"], vec![vec![long(2)]]))
            .await?;
    }
    let snapshot_version = table.log().update().await?.version;
    assert_eq!(snapshot_version, 5);

    let mut stream = table.stream(StreamOptions::default()).await?;

    // Backfill: 5 files attributed to the snapshot version.
    let batch1 = stream.next_batch(limits(2)).await?.expect("batch 1");
    assert_eq!(positions(&batch1), vec![(5, 0), (5, 1)]);
    assert!(batch1.end.is_starting_version);

    let batch2 = stream.next_batch(limits(2)).await?.expect("batch 2");
    assert_eq!(positions(&batch2), vec![(5, 2), (5, 3)]);

    let batch3 = stream.next_batch(limits(2)).await?.expect("batch 3");
    assert_eq!(positions(&batch3), vec![(5, 4)]);

    // End-of-version bump: the committed offset skips past the snapshot.
    assert_eq!(batch3.end.reservoir_version, 6);
    assert_eq!(batch3.end.index, -1);
    assert!(!batch3.end.is_starting_version);

    // Nothing new yet.
    assert!(stream.next_batch(limits(2)).await?.is_none());

    // Two more commits; the next batch drains both files.
    table
        .append(
            &runtime,
            rows_of(&["k"], vec![vec![long(10)], vec![long(20)], vec![long(30)]]),
        )
        .await?;
    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(40)]]))
        .await?;

    let tail = stream.next_batch(limits(2)).await?.expect("tail batch");
    assert_eq!(tail.files.len(), 2);
    assert_eq!(tail.files[0].version, 6);
    assert_eq!(tail.files[1].version, 7);
    Ok(())
}

/// Emitted files are strictly increasing in `(version, index)` with no
/// duplicates across batches, for any admission pattern.
#[tokio::test]
async fn monotonic_positions_without_duplicates() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    for i in 0..7 {
        table
            .append(&runtime, rows_of(&["k"], vec![vec![long(i)]]))
            .await?;
    }

    let mut stream = table.stream(StreamOptions::default()).await?;
    let mut seen: Vec<(Version, i64)> = Vec::new();

    for batch_size in [3usize, 1, 2, 5, 1] {
        match stream.next_batch(limits(batch_size)).await? {
            None => break,
            Some(batch) => seen.extend(positions(&batch)),
        }
    }
    while let Some(batch) = stream.next_batch(limits(2)).await? {
        seen.extend(positions(&batch));
    }

    assert_eq!(seen.len(), 7, "all files delivered exactly once");
    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1], "positions must strictly increase: {seen:?}");
    }
    Ok(())
}

/// `startingVersion` skips the snapshot backfill and tails from the given
/// version.
#[tokio::test]
async fn starting_version_tails_from_there() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    for i in 0..4 {
        table
            .append(&runtime, rows_of(&["k"], vec![vec![long(i)]]))
            .await?;
    }

    let mut stream = table
        .stream(StreamOptions {
            starting: StartingPosition::Version(3),
            ..StreamOptions::default()
        })
        .await?;

    let batch = stream
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .expect("batch");
    assert_eq!(
        positions(&batch),
        vec![(3, 0), (4, 0)],
        "only versions >= 3 are read"
    );
    Ok(())
}

/// `latest` delivers only commits made after the stream was positioned.
#[tokio::test]
async fn starting_latest_sees_only_future_commits() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(1)]]))
        .await?;

    let mut stream = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ..StreamOptions::default()
        })
        .await?;

    assert!(stream
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .is_none());

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(2)]]))
        .await?;

    let batch = stream
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .expect("future commit");
    assert_eq!(batch.files.len(), 1);
    Ok(())
}

/// A version that rewrites data fails the stream unless `ignore_changes`
/// is set; compaction (`dataChange = false`) is invisible either way.
#[tokio::test]
async fn update_mid_stream_requires_ignore_changes() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;

    let mut strict = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ..StreamOptions::default()
        })
        .await?;
    let mut tolerant = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ignore_changes: true,
            ..StreamOptions::default()
        })
        .await?;

    // A rewrite version: remove + add in one commit.
    table
        .update(
            &runtime,
            None,
            [(
                "v".to_string(),
                delta_table_core::expr::Expr::lit(99),
            )]
            .into_iter()
            .collect(),
        )
        .await?;

    let result = strict
        .next_batch(AdmissionLimits::read_all_available())
        .await;
    assert!(
        matches!(result, Err(StreamError::IgnoreChanges { .. })),
        "expected IgnoreChanges, got: {result:?}"
    );

    let batch = tolerant
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .expect("tolerated rewrite");
    assert_eq!(batch.files.len(), 1);
    Ok(())
}

/// A pure-deletion version fails the stream unless `ignore_deletes` is
/// set.
#[tokio::test]
async fn delete_mid_stream_requires_ignore_deletes() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(1)]]))
        .await?;

    let mut strict = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ..StreamOptions::default()
        })
        .await?;
    let mut tolerant = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ignore_deletes: true,
            ..StreamOptions::default()
        })
        .await?;

    // File-level delete: a pure deletion version.
    table.delete(&runtime, None).await?;

    let result = strict
        .next_batch(AdmissionLimits::read_all_available())
        .await;
    assert!(
        matches!(result, Err(StreamError::IgnoreDeletes { .. })),
        "expected IgnoreDeletes, got: {result:?}"
    );

    // Tolerated: the version has no data-changing adds, nothing to emit.
    assert!(tolerant
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .is_none());
    Ok(())
}

/// An incompatible schema change mid-stream fails with `SchemaChanged`;
/// a compatible widening does not.
#[tokio::test]
async fn schema_change_mid_stream() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, true),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;

    let mut stream = table
        .stream(StreamOptions {
            starting: StartingPosition::Latest,
            ..StreamOptions::default()
        })
        .await?;

    // Compatible: append a nullable column.
    let mut widened = table.snapshot().await.metadata.clone();
    widened.schema_string = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, true),
        ("extra", PrimitiveType::String, true),
    ])
    .to_json()?;
    table
        .log()
        .begin_transaction()
        .await
        .commit(
            vec![delta_table_core::transaction_log::Action::Metadata(widened)],
            delta_table_core::transaction::DeltaOperation::AddColumns,
        )
        .await?;

    assert!(stream
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .is_none());

    // Incompatible: drop a column the stream is bound to.
    let mut narrowed = table.snapshot().await.metadata.clone();
    narrowed.schema_string = schema_of(&[("k", PrimitiveType::Integer, false)]).to_json()?;
    table
        .log()
        .begin_transaction()
        .await
        .commit(
            vec![delta_table_core::transaction_log::Action::Metadata(narrowed)],
            delta_table_core::transaction::DeltaOperation::ReplaceColumns,
        )
        .await?;

    let result = stream
        .next_batch(AdmissionLimits::read_all_available())
        .await;
    assert!(
        matches!(result, Err(StreamError::SchemaChanged { .. })),
        "expected SchemaChanged, got: {result:?}"
    );
    Ok(())
}

/// `startingTimestamp` picks the earliest commit at or after the given
/// time.
#[tokio::test]
async fn starting_timestamp_finds_earliest_commit() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(1)]]))
        .await?;
    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(2)]]))
        .await?;

    // Everything is in the past relative to epoch 0.
    let mut from_epoch = table
        .stream(StreamOptions {
            starting: StartingPosition::Timestamp(0),
            ..StreamOptions::default()
        })
        .await?;
    let batch = from_epoch
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .expect("all commits");
    assert_eq!(batch.files.len(), 2);

    // Far future: nothing yet; the stream waits for the next commit.
    let mut from_future = table
        .stream(StreamOptions {
            starting: StartingPosition::Timestamp(i64::MAX),
            ..StreamOptions::default()
        })
        .await?;
    assert!(from_future
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .is_none());

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(3)]]))
        .await?;
    // The "next commit" rule: a commit made after positioning is seen even
    // though its timestamp is below the requested one.
    let batch = from_future
        .next_batch(AdmissionLimits::read_all_available())
        .await?
        .expect("next commit");
    assert_eq!(batch.files.len(), 1);
    Ok(())
}
