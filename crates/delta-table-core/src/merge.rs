//! MERGE: a two-phase, join-based upsert.
//!
//! `MERGE INTO target USING source ON condition` with an ordered list of
//! WHEN clauses. The semantic guarantees, independent of execution
//! strategy:
//!
//! 1. Per row, the first clause (in listed order) whose predicate holds
//!    fires, and only that one. A matched target row satisfying no matched
//!    clause is copied through unchanged; a non-matched source row
//!    satisfying no not-matched clause is dropped.
//! 2. A target row matching more than one source row fails the operation
//!    with [`MergeError::MultipleSourceMatch`] before anything becomes
//!    visible — unless the only matched clause is an unconditional DELETE,
//!    where every join outcome collapses to the same result.
//! 3. With schema evolution enabled, source-only columns widen the target
//!    schema as appended nullable columns.
//! 4. Only the last clause of each side may omit its predicate.
//!
//! Execution happens in three phases (two target scans); see [`execute`].

mod execute;

use std::collections::HashMap;

use snafu::prelude::*;

use crate::expr::Expr;
use crate::runtime::{QueryRuntime, Row, RuntimeError};
use crate::schema::SchemaError;
use crate::transaction::TransactionError;
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::Snapshot;

/// What a matched clause does when it fires.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchedAction {
    /// Rewrite the target row with SET assignments.
    Update {
        /// Target column (or nested path) to expression over both sides.
        set: HashMap<String, Expr>,
    },
    /// Drop the target row.
    Delete,
}

/// A `WHEN MATCHED` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedClause {
    /// Extra predicate over both sides; `None` means unconditional.
    pub predicate: Option<Expr>,
    /// What firing does.
    pub action: MatchedAction,
}

/// A `WHEN NOT MATCHED` clause (insert-only by construction).
#[derive(Debug, Clone, PartialEq)]
pub struct NotMatchedClause {
    /// Extra predicate over the source side; `None` means unconditional.
    pub predicate: Option<Expr>,
    /// Target column to expression over the source row.
    pub values: HashMap<String, Expr>,
}

/// Metrics recorded in the MERGE commit's provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMetrics {
    /// Rows produced by the source.
    pub num_source_rows: usize,
    /// Target rows carried through unchanged.
    pub num_target_rows_copied: usize,
    /// Target rows rewritten by an update clause.
    pub num_target_rows_updated: usize,
    /// Rows inserted by not-matched clauses.
    pub num_target_rows_inserted: usize,
    /// Target rows dropped by a delete clause.
    pub num_target_rows_deleted: usize,
    /// Live files before data skipping.
    pub num_target_files_before_skipping: usize,
    /// Candidate files after data skipping.
    pub num_target_files_after_skipping: usize,
    /// Files tombstoned by the commit.
    pub num_target_files_removed: usize,
    /// Files added by the commit.
    pub num_target_files_added: usize,
}

impl MergeMetrics {
    pub(crate) fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("numSourceRows".to_string(), self.num_source_rows.to_string()),
            (
                "numTargetRowsCopied".to_string(),
                self.num_target_rows_copied.to_string(),
            ),
            (
                "numTargetRowsUpdated".to_string(),
                self.num_target_rows_updated.to_string(),
            ),
            (
                "numTargetRowsInserted".to_string(),
                self.num_target_rows_inserted.to_string(),
            ),
            (
                "numTargetRowsDeleted".to_string(),
                self.num_target_rows_deleted.to_string(),
            ),
            (
                "numTargetFilesBeforeSkipping".to_string(),
                self.num_target_files_before_skipping.to_string(),
            ),
            (
                "numTargetFilesAfterSkipping".to_string(),
                self.num_target_files_after_skipping.to_string(),
            ),
            (
                "numTargetFilesRemoved".to_string(),
                self.num_target_files_removed.to_string(),
            ),
            (
                "numTargetFilesAdded".to_string(),
                self.num_target_files_added.to_string(),
            ),
        ])
    }
}

/// Errors raised by MERGE.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MergeError {
    /// A target row joined with more than one source row and the clause
    /// list does not make that unambiguous.
    #[snafu(display(
        "MERGE failed: {count} source rows matched the same target row; \
         the operation would be nondeterministic"
    ))]
    MultipleSourceMatch {
        /// How many source rows matched the worst target row.
        count: u64,
    },

    /// A clause without a predicate is not last on its side.
    #[snafu(display("Only the last WHEN {side} clause may omit its predicate"))]
    UnconditionalClauseNotLast {
        /// `MATCHED` or `NOT MATCHED`.
        side: &'static str,
    },

    /// Commit failure, including classified conflicts.
    #[snafu(display("Transaction error in MERGE: {source}"))]
    MergeTxn {
        /// Underlying transaction error.
        #[snafu(source)]
        source: TransactionError,
    },

    /// Query runtime failure.
    #[snafu(display("Query runtime error in MERGE: {source}"))]
    MergeRuntime {
        /// Underlying runtime error.
        #[snafu(source)]
        source: RuntimeError,
    },

    /// Schema validation or evolution failure.
    #[snafu(display("Schema error in MERGE: {source}"))]
    MergeSchema {
        /// Underlying schema error.
        #[snafu(source)]
        source: SchemaError,
    },
}

/// Builder for a MERGE operation.
///
/// ```ignore
/// table.merge(source_columns, source_rows, condition)
///     .when_matched_update(None, set)
///     .when_not_matched_insert(None, values)
///     .execute(&runtime)
///     .await?;
/// ```
#[derive(Debug)]
pub struct MergeBuilder {
    store: LogStore,
    snapshot: Snapshot,
    source_columns: Vec<String>,
    source_rows: Vec<Row>,
    condition: Expr,
    matched: Vec<MatchedClause>,
    not_matched: Vec<NotMatchedClause>,
    source_alias: String,
    target_alias: String,
    schema_evolution: Option<bool>,
}

impl MergeBuilder {
    /// Start building a MERGE of `source_rows` into the table.
    ///
    /// `source_rows` must carry `source_columns` as their schema; the
    /// condition and clause expressions reference columns qualified with
    /// the aliases (`source.k`, `target.k` by default).
    pub fn new(
        store: LogStore,
        snapshot: Snapshot,
        source_columns: Vec<String>,
        source_rows: Vec<Row>,
        condition: Expr,
    ) -> Self {
        Self {
            store,
            snapshot,
            source_columns,
            source_rows,
            condition,
            matched: Vec::new(),
            not_matched: Vec::new(),
            source_alias: "source".to_string(),
            target_alias: "target".to_string(),
            schema_evolution: None,
        }
    }

    /// Set the alias the source side is referenced by.
    pub fn with_source_alias(mut self, alias: impl Into<String>) -> Self {
        self.source_alias = alias.into();
        self
    }

    /// Set the alias the target side is referenced by.
    pub fn with_target_alias(mut self, alias: impl Into<String>) -> Self {
        self.target_alias = alias.into();
        self
    }

    /// Force schema evolution on or off, overriding `autoMerge.schema`.
    pub fn with_schema_evolution(mut self, enabled: bool) -> Self {
        self.schema_evolution = Some(enabled);
        self
    }

    /// Append a `WHEN MATCHED ... THEN UPDATE SET` clause.
    pub fn when_matched_update(
        mut self,
        predicate: Option<Expr>,
        set: HashMap<String, Expr>,
    ) -> Self {
        self.matched.push(MatchedClause {
            predicate,
            action: MatchedAction::Update { set },
        });
        self
    }

    /// Append a `WHEN MATCHED ... THEN DELETE` clause.
    pub fn when_matched_delete(mut self, predicate: Option<Expr>) -> Self {
        self.matched.push(MatchedClause {
            predicate,
            action: MatchedAction::Delete,
        });
        self
    }

    /// Append a `WHEN NOT MATCHED ... THEN INSERT` clause.
    pub fn when_not_matched_insert(
        mut self,
        predicate: Option<Expr>,
        values: HashMap<String, Expr>,
    ) -> Self {
        self.not_matched.push(NotMatchedClause { predicate, values });
        self
    }

    fn validate_clause_order(&self) -> Result<(), MergeError> {
        for clause in self.matched.iter().rev().skip(1) {
            ensure!(
                clause.predicate.is_some(),
                UnconditionalClauseNotLastSnafu { side: "MATCHED" }
            );
        }
        for clause in self.not_matched.iter().rev().skip(1) {
            ensure!(
                clause.predicate.is_some(),
                UnconditionalClauseNotLastSnafu {
                    side: "NOT MATCHED"
                }
            );
        }
        Ok(())
    }

    /// Whether the clause list makes multiple source matches harmless: the
    /// single matched clause is an unconditional DELETE, so every matching
    /// target row is dropped no matter which source row it pairs with.
    fn is_unambiguous_delete(&self) -> bool {
        self.matched.len() == 1
            && self.matched[0].predicate.is_none()
            && matches!(self.matched[0].action, MatchedAction::Delete)
    }

    /// Run the merge and commit its effects.
    pub async fn execute(
        self,
        runtime: &dyn QueryRuntime,
    ) -> Result<(Version, MergeMetrics), MergeError> {
        self.validate_clause_order()?;
        execute::run(self, runtime).await
    }
}
