//! DELETE: file-level removal where possible, row-level rewrite where not.
//!
//! Three escalation tiers, cheapest first:
//! - no predicate: tombstone every live file, nothing is rewritten;
//! - partition-only predicate: tombstone the matching partitions (every row
//!   of a surviving file shares its partition values, so the whole file
//!   matches);
//! - row-level predicate: rewrite each candidate file that actually
//!   contains a matching row, keeping the rows where the predicate does
//!   not hold.

use std::collections::HashMap;

use snafu::prelude::*;
use snafu::IntoError;

use crate::expr::Expr;
use crate::operations::{DmlError, DmlRuntimeSnafu, DmlSchemaSnafu, DmlTxnSnafu};
use crate::runtime::local::stream_from;
use crate::runtime::{QueryRuntime, Row};
use crate::transaction::{DeltaOperation, OptimisticTransaction};
use crate::transaction_log::actions::{Action, AddFile, RemoveFile};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::Snapshot;

/// Metrics reported by a DELETE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteMetrics {
    /// Files tombstoned.
    pub num_removed_files: usize,
    /// Files written by the rewrite tier.
    pub num_added_files: usize,
    /// Rows deleted (row-level tier only; file-level tiers do not scan).
    pub num_deleted_rows: Option<usize>,
    /// Rows carried into rewritten files.
    pub num_copied_rows: Option<usize>,
}

impl DeleteMetrics {
    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::from([
            (
                "numRemovedFiles".to_string(),
                self.num_removed_files.to_string(),
            ),
            (
                "numAddedFiles".to_string(),
                self.num_added_files.to_string(),
            ),
        ]);
        if let Some(rows) = self.num_deleted_rows {
            map.insert("numDeletedRows".to_string(), rows.to_string());
        }
        if let Some(rows) = self.num_copied_rows {
            map.insert("numCopiedRows".to_string(), rows.to_string());
        }
        map
    }
}

pub(crate) async fn delete(
    store: &LogStore,
    snapshot: Snapshot,
    runtime: &dyn QueryRuntime,
    predicate: Option<Expr>,
) -> Result<(Version, DeleteMetrics), DmlError> {
    let partition_columns = snapshot.partition_columns().to_vec();
    let mut txn = OptimisticTransaction::new(store.clone(), snapshot);
    let mut metrics = DeleteMetrics::default();

    let mut actions: Vec<Action> = Vec::new();

    match &predicate {
        None => {
            // Whole-table delete never rewrites.
            for file in txn.read_whole_table() {
                actions.push(Action::Remove(RemoveFile::new(file.path)));
            }
            metrics.num_removed_files = actions.len();
        }
        Some(pred)
            if pred.references_only(|name| partition_columns.iter().any(|c| c == name)) =>
        {
            for file in txn.filter_files(std::slice::from_ref(pred)).context(DmlTxnSnafu)? {
                actions.push(Action::Remove(RemoveFile::new(file.path)));
            }
            metrics.num_removed_files = actions.len();
        }
        Some(pred) => {
            let (rewrite_actions, deleted, copied) =
                rewrite_not_matching(store, runtime, &mut txn, pred).await?;
            metrics.num_removed_files = rewrite_actions
                .iter()
                .filter(|a| matches!(a, Action::Remove(_)))
                .count();
            metrics.num_added_files = rewrite_actions
                .iter()
                .filter(|a| matches!(a, Action::Add(_)))
                .count();
            metrics.num_deleted_rows = Some(deleted);
            metrics.num_copied_rows = Some(copied);
            actions = rewrite_actions;
        }
    }

    let operation = DeltaOperation::Delete {
        predicate: predicate.clone(),
    };
    let version = txn
        .commit_with_metrics(actions, operation, metrics.to_map())
        .await
        .context(DmlTxnSnafu)?;
    Ok((version, metrics))
}

/// File-level delete restricted to partition predicates.
///
/// Rejects any predicate touching non-partition columns instead of silently
/// escalating to a rewrite.
pub(crate) async fn delete_partitions(
    store: &LogStore,
    snapshot: Snapshot,
    runtime: &dyn QueryRuntime,
    predicate: Expr,
) -> Result<(Version, DeleteMetrics), DmlError> {
    let partition_columns = snapshot.partition_columns().to_vec();
    ensure!(
        predicate.references_only(|name| partition_columns.iter().any(|c| c == name)),
        crate::operations::NonPartitionPredicateSnafu {
            predicate: predicate.to_string(),
        }
    );
    delete(store, snapshot, runtime, Some(predicate)).await
}

/// Rewrite candidate files, keeping rows where `pred` does not hold.
async fn rewrite_not_matching(
    store: &LogStore,
    runtime: &dyn QueryRuntime,
    txn: &mut OptimisticTransaction,
    pred: &Expr,
) -> Result<(Vec<Action>, usize, usize), DmlError> {
    let schema = txn.snapshot().schema().context(DmlSchemaSnafu)?;
    let partition_columns = txn.snapshot().partition_columns().to_vec();
    let candidates = txn
        .filter_files(std::slice::from_ref(pred))
        .context(DmlTxnSnafu)?;

    let mut actions = Vec::new();
    let mut deleted = 0usize;
    let mut copied = 0usize;

    for file in candidates {
        let rows: Vec<Row> = runtime
            .scan(
                store.location(),
                std::slice::from_ref(&file),
                &schema,
                None,
            )
            .context(DmlRuntimeSnafu)?
            .collect::<Result<_, _>>()
            .context(DmlRuntimeSnafu)?;

        let mut keep: Vec<Row> = Vec::with_capacity(rows.len());
        let mut matched = 0usize;
        for row in rows {
            let selected = pred
                .eval_predicate(&row)
                .map_err(|e| crate::runtime::RuntimeExprSnafu.into_error(e))
                .context(DmlRuntimeSnafu)?;
            if selected {
                matched += 1;
            } else {
                keep.push(row);
            }
        }

        // Skipping was only probabilistic; an untouched file stays as-is.
        if matched == 0 {
            continue;
        }

        deleted += matched;
        copied += keep.len();

        let mut rewrite = rewrite_file(store, runtime, &schema, &partition_columns, keep)?;
        actions.push(Action::Remove(RemoveFile::new(file.path)));
        actions.append(&mut rewrite);
    }

    Ok((actions, deleted, copied))
}

pub(crate) fn rewrite_file(
    store: &LogStore,
    runtime: &dyn QueryRuntime,
    schema: &crate::schema::StructType,
    partition_columns: &[String],
    keep: Vec<Row>,
) -> Result<Vec<Action>, DmlError> {
    if keep.is_empty() {
        return Ok(Vec::new());
    }
    let added: Vec<AddFile> = runtime
        .write(
            store.location(),
            stream_from(keep),
            schema,
            partition_columns,
        )
        .context(DmlRuntimeSnafu)?;
    Ok(added.into_iter().map(Action::Add).collect())
}
