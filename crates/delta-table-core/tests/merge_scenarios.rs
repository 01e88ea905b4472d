//! End-to-end MERGE scenarios.
//!
//! These exercise the two-phase engine through the public table API with
//! the bundled local runtime: clause ordering, multi-match detection, the
//! insert-only fast path, null-safe join conditions, and schema evolution.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashMap;

use common::*;
use delta_table_core::expr::Expr;
use delta_table_core::merge::MergeError;
use delta_table_core::runtime::LocalRuntime;
use delta_table_core::schema::PrimitiveType;

fn set(pairs: Vec<(&str, Expr)>) -> HashMap<String, Expr> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

// =============================================================================
// Basic update + insert
// =============================================================================

/// Matched rows are updated, unmatched source rows inserted, untouched
/// target rows carried through.
#[tokio::test]
async fn merge_update_and_insert() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k2", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec!["k2".to_string()], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k2", "v"], vec![vec![long(2), long(2)], vec![long(1), long(4)]]),
        )
        .await?;

    let source = rows_of(&["k1", "v"], vec![vec![long(1), long(1)], vec![long(0), long(3)]]);
    let (version, metrics) = table
        .merge(
            vec!["k1".to_string(), "v".to_string()],
            source,
            Expr::col("source.k1").eq(Expr::col("target.k2")),
        )
        .await?
        .when_matched_update(
            None,
            set(vec![
                ("k2", Expr::lit(20).add(Expr::col("source.k1"))),
                ("v", Expr::lit(20).add(Expr::col("source.v"))),
            ]),
        )
        .when_not_matched_insert(
            None,
            set(vec![
                ("k2", Expr::col("source.k1").sub(Expr::lit(10))),
                ("v", Expr::col("source.v").add(Expr::lit(10))),
            ]),
        )
        .execute(&runtime)
        .await?;

    assert_eq!(version, 2);
    assert_eq!(metrics.num_source_rows, 2);
    assert_eq!(metrics.num_target_rows_updated, 1);
    assert_eq!(metrics.num_target_rows_inserted, 1);
    assert_eq!(metrics.num_target_rows_deleted, 0);

    let contents = table_contents(&table, &runtime).await;
    assert_eq!(
        contents,
        sorted(vec![
            vec![long(2), long(2)],
            vec![long(21), long(21)],
            vec![long(-10), long(13)],
        ])
    );
    Ok(())
}

// =============================================================================
// Multi-match detection
// =============================================================================

/// Two source rows matching one target row is nondeterministic for an
/// update clause: the operation fails and the target is untouched.
#[tokio::test]
async fn merge_multiple_source_match_fails() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k2", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k2", "v"], vec![vec![long(1), long(1)], vec![long(2), long(2)]]),
        )
        .await?;
    let before = table_contents(&table, &runtime).await;

    let source = rows_of(
        &["k1", "v"],
        vec![
            vec![long(0), long(0)],
            vec![long(1), long(10)],
            vec![long(1), long(11)],
        ],
    );
    let result = table
        .merge(
            vec!["k1".to_string(), "v".to_string()],
            source,
            Expr::col("source.k1").eq(Expr::col("target.k2")),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]))
        .execute(&runtime)
        .await;

    assert!(
        matches!(result, Err(MergeError::MultipleSourceMatch { count: 2 })),
        "expected MultipleSourceMatch, got: {result:?}"
    );

    // Nothing became visible.
    assert_eq!(table.version().await, 1);
    assert_eq!(table_contents(&table, &runtime).await, before);
    Ok(())
}

/// The one unambiguous multi-match shape: a single unconditional DELETE.
/// Every matching target row is dropped regardless of pairing.
#[tokio::test]
async fn merge_multiple_match_unconditional_delete_succeeds() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k2", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k2", "v"], vec![vec![long(1), long(1)], vec![long(2), long(2)]]),
        )
        .await?;

    let source = rows_of(
        &["k1", "v"],
        vec![
            vec![long(0), long(0)],
            vec![long(1), long(10)],
            vec![long(1), long(100)],
            vec![long(3), long(30)],
        ],
    );
    let (_, metrics) = table
        .merge(
            vec!["k1".to_string(), "v".to_string()],
            source,
            Expr::col("source.k1").eq(Expr::col("target.k2")),
        )
        .await?
        .when_matched_delete(None)
        .execute(&runtime)
        .await?;

    assert_eq!(metrics.num_target_rows_deleted, 2, "both join pairs drop the same row");
    assert_eq!(
        table_contents(&table, &runtime).await,
        vec![vec![long(2), long(2)]]
    );
    Ok(())
}

// =============================================================================
// Insert-only fast path
// =============================================================================

/// An insert-only merge takes the anti-join fast path and removes no
/// target file.
#[tokio::test]
async fn merge_insert_only_fast_path() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k1", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k1", "v"], vec![vec![long(1), long(1)], vec![long(2), long(2)]]),
        )
        .await?;

    let source = rows_of(&["k1", "v"], vec![vec![long(1), long(10)], vec![long(3), long(30)]]);
    let (_, metrics) = table
        .merge(
            vec!["k1".to_string(), "v".to_string()],
            source,
            Expr::col("source.k1").eq(Expr::col("target.k1")),
        )
        .await?
        .when_not_matched_insert(
            None,
            set(vec![("k1", Expr::col("source.k1")), ("v", Expr::col("source.v"))]),
        )
        .execute(&runtime)
        .await?;

    assert_eq!(metrics.num_target_files_removed, 0);
    assert_eq!(metrics.num_target_rows_inserted, 1);
    assert_eq!(metrics.num_target_rows_updated, 0);

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![
            vec![long(1), long(1)],
            vec![long(2), long(2)],
            vec![long(3), long(30)],
        ])
    );
    Ok(())
}

// =============================================================================
// Clause ordering and predicates
// =============================================================================

/// Clauses fire in listed order; rows satisfying no clause on their side
/// are copied (matched) or dropped (not matched).
#[tokio::test]
async fn merge_ordered_clauses_first_match_fires() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("key", PrimitiveType::String, false),
        ("value", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(
                &["key", "value"],
                vec![
                    vec![text("a"), long(1)],
                    vec![text("b"), long(2)],
                    vec![text("c"), long(3)],
                    vec![text("d"), long(4)],
                ],
            ),
        )
        .await?;

    let source = rows_of(
        &["k", "v"],
        vec![
            vec![text("a"), long(-1)],
            vec![text("b"), long(0)],
            vec![text("e"), long(-5)],
            vec![text("f"), long(-6)],
        ],
    );
    table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            source,
            Expr::col("source.k").eq(Expr::col("target.key")),
        )
        .await?
        .when_matched_update(
            Some(Expr::col("source.k").eq(Expr::lit("a"))),
            set(vec![("value", Expr::col("source.v").add(Expr::lit(0)))]),
        )
        .when_matched_delete(Some(Expr::col("source.k").eq(Expr::lit("b"))))
        .when_not_matched_insert(
            Some(Expr::col("source.k").eq(Expr::lit("e"))),
            set(vec![
                ("key", Expr::col("source.k")),
                ("value", Expr::col("source.v").add(Expr::lit(0))),
            ]),
        )
        .execute(&runtime)
        .await?;

    // a updated, b deleted, e inserted, f dropped, c/d untouched.
    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![
            vec![text("a"), long(-1)],
            vec![text("c"), long(3)],
            vec![text("d"), long(4)],
            vec![text("e"), long(-5)],
        ])
    );
    Ok(())
}

/// A non-final clause without a predicate is rejected before any work.
#[tokio::test]
async fn merge_unconditional_clause_must_be_last() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    let result = table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            rows_of(&["k", "v"], vec![vec![long(1), long(1)]]),
            Expr::col("source.k").eq(Expr::col("target.k")),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]))
        .when_matched_delete(Some(Expr::col("source.v").lt(Expr::lit(0))))
        .execute(&runtime)
        .await;

    assert!(matches!(
        result,
        Err(MergeError::UnconditionalClauseNotLast { side: "MATCHED" })
    ));
    Ok(())
}

// =============================================================================
// Null-safe join
// =============================================================================

/// `<=>` pairs NULL keys, so a NULL-keyed target row is updated rather
/// than left behind plus inserted.
#[tokio::test]
async fn merge_null_safe_equality_condition() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, true),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["k", "v"], vec![vec![long(1), long(1)], vec![null(), null()]]),
        )
        .await?;

    let source = rows_of(
        &["k", "v"],
        vec![
            vec![long(1), long(10)],
            vec![long(2), long(20)],
            vec![null(), long(0)],
        ],
    );
    table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            source,
            Expr::col("source.k").null_safe_eq(Expr::col("target.k")),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]))
        .when_not_matched_insert(
            None,
            set(vec![("k", Expr::col("source.k")), ("v", Expr::col("source.v"))]),
        )
        .execute(&runtime)
        .await?;

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![
            vec![null(), long(0)],
            vec![long(1), long(10)],
            vec![long(2), long(20)],
        ])
    );
    Ok(())
}

// =============================================================================
// Schema evolution
// =============================================================================

/// With evolution enabled, source-only columns widen the target schema as
/// appended nullable columns; pre-existing rows read NULL for them.
#[tokio::test]
async fn merge_schema_evolution_appends_nullable_column() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("key", PrimitiveType::Integer, false),
        ("value", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    table
        .append(
            &runtime,
            rows_of(&["key", "value"], vec![vec![long(1), long(1)]]),
        )
        .await?;

    let source = rows_of(
        &["key", "value", "extra"],
        vec![vec![long(2), long(2), text("x")]],
    );
    table
        .merge(
            vec!["key".to_string(), "value".to_string(), "extra".to_string()],
            source,
            Expr::col("source.key").eq(Expr::col("target.key")),
        )
        .await?
        .with_schema_evolution(true)
        .when_matched_update(
            None,
            set(vec![
                ("value", Expr::col("source.value")),
                ("extra", Expr::col("source.extra")),
            ]),
        )
        .when_not_matched_insert(
            None,
            set(vec![
                ("key", Expr::col("source.key")),
                ("value", Expr::col("source.value")),
                ("extra", Expr::col("source.extra")),
            ]),
        )
        .execute(&runtime)
        .await?;

    let snapshot = table.log().update().await?;
    let evolved = snapshot.schema()?;
    assert_eq!(
        evolved.field_names().collect::<Vec<_>>(),
        vec!["key", "value", "extra"]
    );
    let extra = evolved.field("extra").expect("extra column");
    assert!(extra.nullable);

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![
            vec![long(1), long(1), null()],
            vec![long(2), long(2), text("x")],
        ])
    );
    Ok(())
}

/// Without evolution, a source-only column in the insert map is rejected.
#[tokio::test]
async fn merge_without_evolution_rejects_new_columns() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("key", PrimitiveType::Integer, false),
        ("value", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    let source = rows_of(
        &["key", "value", "extra"],
        vec![vec![long(2), long(2), text("x")]],
    );
    let result = table
        .merge(
            vec!["key".to_string(), "value".to_string(), "extra".to_string()],
            source,
            Expr::col("source.key").eq(Expr::col("target.key")),
        )
        .await?
        .when_not_matched_insert(
            None,
            set(vec![
                ("key", Expr::col("source.key")),
                ("extra", Expr::col("source.extra")),
            ]),
        )
        .execute(&runtime)
        .await;

    assert!(matches!(result, Err(MergeError::MergeSchema { .. })));
    Ok(())
}

// =============================================================================
// Metrics
// =============================================================================

/// File-level metrics reflect skipping and the touched-file set.
#[tokio::test]
async fn merge_records_file_metrics() -> TestResult {
    let runtime = LocalRuntime::new();
    let schema = schema_of(&[
        ("k", PrimitiveType::Integer, false),
        ("v", PrimitiveType::Integer, false),
    ]);
    let (_tmp, table) = create_table(schema, vec![], HashMap::new()).await;

    // Two files with disjoint key ranges.
    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(1), long(1)]]))
        .await?;
    table
        .append(&runtime, rows_of(&["k", "v"], vec![vec![long(100), long(100)]]))
        .await?;

    let source = rows_of(&["k", "v"], vec![vec![long(1), long(11)]]);
    let (_, metrics) = table
        .merge(
            vec!["k".to_string(), "v".to_string()],
            source,
            Expr::col("source.k")
                .eq(Expr::col("target.k"))
                .and(Expr::col("target.k").lt(Expr::lit(50))),
        )
        .await?
        .when_matched_update(None, set(vec![("v", Expr::col("source.v"))]))
        .execute(&runtime)
        .await?;

    assert_eq!(metrics.num_target_files_before_skipping, 2);
    assert_eq!(
        metrics.num_target_files_after_skipping, 1,
        "the target-only conjunct k < 50 prunes the second file"
    );
    assert_eq!(metrics.num_target_files_removed, 1);
    assert_eq!(metrics.num_target_rows_updated, 1);

    assert_eq!(
        table_contents(&table, &runtime).await,
        sorted(vec![vec![long(1), long(11)], vec![long(100), long(100)]])
    );
    Ok(())
}
