//! Concurrency scenarios through the public API.
//!
//! Serializability is anchored on the log store's create-only commit
//! write: of two writers targeting the same version, exactly one wins and
//! the other either rebases (provably disjoint) or aborts with a
//! classified conflict.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashMap;

use common::*;
use delta_table_core::expr::Expr;
use delta_table_core::merge::MergeError;
use delta_table_core::runtime::LocalRuntime;
use delta_table_core::schema::PrimitiveType;
use delta_table_core::table::DeltaTable;
use delta_table_core::transaction::{ConflictError, TransactionError};
use delta_table_core::transaction_log::actions::{Action, AddFile, RemoveFile};
use delta_table_core::transaction_log::Snapshot;

fn set(pairs: Vec<(&str, Expr)>) -> HashMap<String, Expr> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Two commits from the same base version: one wins the version, the
/// loser lands on the next one with the winner's effects visible.
#[tokio::test]
async fn serializable_commits_from_same_base() -> TestResult {
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    // Both transactions start from version 0.
    let txn_a = table.log().begin_transaction().await;
    let txn_b = table.log().begin_transaction().await;
    assert_eq!(txn_a.read_version(), 0);
    assert_eq!(txn_b.read_version(), 0);

    let op = delta_table_core::transaction::DeltaOperation::Write {
        mode: "Append".to_string(),
        partition_by: None,
    };

    let v_a = txn_a
        .commit(vec![Action::Add(AddFile::new("a.json", 1))], op.clone())
        .await?;
    let v_b = txn_b
        .commit(vec![Action::Add(AddFile::new("b.json", 1))], op)
        .await?;

    assert_eq!(v_a, 1);
    assert_eq!(v_b, 2);

    let snapshot = Snapshot::load(table.log().store(), None).await?;
    assert!(snapshot.files.contains_key("a.json"));
    assert!(snapshot.files.contains_key("b.json"));
    Ok(())
}

/// A concurrent append whose file overlaps a MERGE's read predicates
/// aborts the merge with `ConcurrentAppend`.
#[tokio::test]
async fn concurrent_append_aborts_overlapping_merge() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;

    // T1 prepares a merge reading k = 1 (the builder captures version 1).
    let merge = table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            rows_of(&["k", "v"], vec![vec![long(1), long(10)]]),
            Expr::col("source.k")
                .eq(Expr::col("target.k"))
                .and(Expr::col("target.k").eq(Expr::lit(1))),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]));

    // T2 appends a file overlapping k = 1 and commits first.
    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(99)]]))
        .await?;

    let result = merge.execute(&runtime).await;
    assert!(
        matches!(
            result,
            Err(MergeError::MergeTxn {
                source: TransactionError::Conflict {
                    source: ConflictError::ConcurrentAppend { .. }
                }
            })
        ),
        "expected ConcurrentAppend, got: {result:?}"
    );
    Ok(())
}

/// A concurrent append provably disjoint from the merge's reads rebases
/// and commits instead of aborting.
#[tokio::test]
async fn disjoint_concurrent_append_rebases() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;

    let merge = table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            rows_of(&["k", "v"], vec![vec![long(1), long(10)]]),
            Expr::col("source.k")
                .eq(Expr::col("target.k"))
                .and(Expr::col("target.k").lt(Expr::lit(50))),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]));

    // Disjoint by stats: k = 1000 cannot satisfy k < 50.
    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1000), long(0)]]))
        .await?;

    let (version, _) = merge.execute(&runtime).await?;
    assert_eq!(version, 3, "merge rebased past the disjoint append");

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![vec![long(1), long(10)], vec![long(1000), long(0)]])
    );
    Ok(())
}

/// Two DELETEs racing for the same file: the loser aborts with
/// `ConcurrentDeleteDelete`.
#[tokio::test]
async fn double_delete_is_classified() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;

    let snapshot = table.log().update().await?;
    let path = snapshot.files.keys().next().expect("one file").clone();

    // Both transactions plan to remove the same file.
    let mut txn_a = table.log().begin_transaction().await;
    let mut txn_b = table.log().begin_transaction().await;
    txn_a.read_whole_table();
    txn_b.read_whole_table();

    let op = delta_table_core::transaction::DeltaOperation::Delete { predicate: None };

    txn_a
        .commit(vec![Action::Remove(RemoveFile::new(path.clone()))], op.clone())
        .await?;

    let result = txn_b
        .commit(vec![Action::Remove(RemoveFile::new(path))], op)
        .await;
    assert!(matches!(
        result,
        Err(TransactionError::Conflict {
            source: ConflictError::ConcurrentDeleteDelete { .. }
        })
    ));
    Ok(())
}

/// A metadata change by the winner aborts any concurrent writer.
#[tokio::test]
async fn metadata_change_aborts_concurrent_writer() -> TestResult {
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, true),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    let loser = table.log().begin_transaction().await;

    // Winner widens the schema.
    let mut metadata = table.snapshot().await.metadata.clone();
    metadata.schema_string = schema_of(&[
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
            vec![Action::Metadata(metadata)],
            delta_table_core::transaction::DeltaOperation::AddColumns,
        )
        .await?;

    let result = loser
        .commit(
            vec![Action::Add(AddFile::new("late.json", 1))],
            delta_table_core::transaction::DeltaOperation::Write {
                mode: "Append".to_string(),
                partition_by: None,
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(TransactionError::Conflict {
            source: ConflictError::MetadataChanged { .. }
        })
    ));
    Ok(())
}

/// Conflict errors carry the winning commit's provenance.
#[tokio::test]
async fn conflicts_carry_winning_commit_info() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[("k", PrimitiveType::Integer, false)]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(&runtime, rows_of(&["k"], vec![vec![long(1)]]))
        .await?;

    let snapshot = table.log().update().await?;
    let path = snapshot.files.keys().next().expect("one file").clone();

    let mut loser = table.log().begin_transaction().await;
    loser.read_whole_table();

    let (winner_version, _) = table.delete(&runtime, None).await?;
    assert_eq!(winner_version, 2);

    let result = loser
        .commit(
            vec![Action::Remove(RemoveFile::new(path))],
            delta_table_core::transaction::DeltaOperation::Delete { predicate: None },
        )
        .await;

    match result {
        Err(TransactionError::Conflict {
            source: ConflictError::ConcurrentDeleteDelete { winning_commit, .. },
        }) => {
            let info = winning_commit.expect("winning commit info");
            assert_eq!(info.operation.as_deref(), Some("DELETE"));
        }
        other => panic!("expected ConcurrentDeleteDelete with provenance, got: {other:?}"),
    }
    Ok(())
}

/// MERGE survives compatible interleavings and aborts incompatible ones;
/// in both cases the table stays consistent.
#[tokio::test]
async fn interleaved_merges_keep_table_consistent() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k", "v"], vec![vec![long(1), long(1)], vec![long(2), long(2)]]),
        )
        .await?;

    // Run several merges sequentially through fresh handles, as separate
    // committers would.
    for (key, value) in [(1i64, 10i64), (2, 20), (3, 30)] {
        let handle = DeltaTable::open(table.log().location().clone()).await?;
        handle
            .merge(
                vec!["k".to_string(), "v".to_string()],
                rows_of(&["k", "v"], vec![vec![long(key), long(value)]]),
                Expr::col("source.k").eq(Expr::col("target.k")),
            )
            .await?
            .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]))
            .when_not_matched_insert(
                None,
                set(vec![("k", Expr::col("source.k")), ("v", Expr::col("source.v"))]),
            )
            .execute(&runtime)
            .await?;
    }

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![
            vec![long(1), long(10)],
            vec![long(2), long(20)],
            vec![long(3), long(30)],
        ])
    );
    Ok(())
}
