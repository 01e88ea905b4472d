//! UPDATE: rewrite affected files with SET assignments applied.
//!
//! Candidate files come from the index; each file that actually contains a
//! matching row is rewritten with the assignments applied to matching rows
//! and every other row carried forward verbatim. Assignment paths are
//! validated against the schema (struct traversal only, no overlaps)
//! before any file is touched.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::prelude::*;
use snafu::IntoError;

use crate::expr::Expr;
use crate::operations::delete::rewrite_file;
use crate::operations::{DmlError, DmlRuntimeSnafu, DmlSchemaSnafu, DmlTxnSnafu};
use crate::runtime::{QueryRuntime, Row};
use crate::schema::assignments::validate_set_paths;
use crate::transaction::{DeltaOperation, OptimisticTransaction};
use crate::transaction_log::actions::{Action, RemoveFile};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::Snapshot;

/// Metrics reported by an UPDATE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMetrics {
    /// Files tombstoned.
    pub num_removed_files: usize,
    /// Files written.
    pub num_added_files: usize,
    /// Rows the assignments were applied to.
    pub num_updated_rows: usize,
    /// Rows carried forward verbatim.
    pub num_copied_rows: usize,
}

impl UpdateMetrics {
    fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "numRemovedFiles".to_string(),
                self.num_removed_files.to_string(),
            ),
            (
                "numAddedFiles".to_string(),
                self.num_added_files.to_string(),
            ),
            (
                "numUpdatedRows".to_string(),
                self.num_updated_rows.to_string(),
            ),
            (
                "numCopiedRows".to_string(),
                self.num_copied_rows.to_string(),
            ),
        ])
    }
}

/// Apply `assignments` to a row, returning the updated row.
pub(crate) fn apply_assignments(
    row: &Row,
    assignments: &HashMap<String, Expr>,
) -> Result<Row, crate::expr::ExprError> {
    let schema = Arc::clone(row.schema());
    let mut values = row.values().to_vec();
    for (column, expr) in assignments {
        if let Some(position) = schema.position(column) {
            values[position] = expr.eval(row)?;
        }
    }
    Ok(Row::new(schema, values))
}

pub(crate) async fn update(
    store: &LogStore,
    snapshot: Snapshot,
    runtime: &dyn QueryRuntime,
    predicate: Option<Expr>,
    assignments: HashMap<String, Expr>,
) -> Result<(Version, UpdateMetrics), DmlError> {
    ensure!(!assignments.is_empty(), crate::operations::EmptyAssignmentsSnafu);

    let schema = snapshot.schema().context(DmlSchemaSnafu)?;
    validate_set_paths(&schema, assignments.keys().map(String::as_str))
        .context(DmlSchemaSnafu)?;

    let partition_columns = snapshot.partition_columns().to_vec();
    let mut txn = OptimisticTransaction::new(store.clone(), snapshot);
    let mut metrics = UpdateMetrics::default();
    let mut actions: Vec<Action> = Vec::new();

    let candidates = match &predicate {
        Some(pred) => txn
            .filter_files(std::slice::from_ref(pred))
            .context(DmlTxnSnafu)?,
        None => txn.read_whole_table(),
    };

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

        let mut rewritten: Vec<Row> = Vec::with_capacity(rows.len());
        let mut updated = 0usize;
        let mut copied = 0usize;
        for row in rows {
            let selected = match &predicate {
                Some(pred) => pred
                    .eval_predicate(&row)
                    .map_err(|e| crate::runtime::RuntimeExprSnafu.into_error(e))
                    .context(DmlRuntimeSnafu)?,
                None => true,
            };
            if selected {
                let new_row = apply_assignments(&row, &assignments)
                    .map_err(|e| crate::runtime::RuntimeExprSnafu.into_error(e))
                    .context(DmlRuntimeSnafu)?;
                rewritten.push(new_row);
                updated += 1;
            } else {
                rewritten.push(row);
                copied += 1;
            }
        }

        if updated == 0 {
            continue;
        }

        metrics.num_updated_rows += updated;
        metrics.num_copied_rows += copied;

        let mut rewrite = rewrite_file(store, runtime, &schema, &partition_columns, rewritten)?;
        metrics.num_removed_files += 1;
        metrics.num_added_files += rewrite
            .iter()
            .filter(|a| matches!(a, Action::Add(_)))
            .count();
        actions.push(Action::Remove(RemoveFile::new(file.path)));
        actions.append(&mut rewrite);
    }

    let operation = DeltaOperation::Update {
        predicate: predicate.clone(),
    };
    let version = txn
        .commit_with_metrics(actions, operation, metrics.to_map())
        .await
        .context(DmlTxnSnafu)?;
    Ok((version, metrics))
}
