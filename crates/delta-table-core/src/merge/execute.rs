//! MERGE execution: three phases, two scans of the target.
//!
//! Phase A narrows the target to `touched_files`: data skipping with the
//! target-only conjuncts of the condition, then an inner join of source
//! against the surviving files with a synthesized row identity and file
//! provenance. The per-identity match counts drive multi-match detection
//! before anything is written.
//!
//! Phase B produces the replacement rows. Insert-only merges take a LEFT
//! ANTI fast path that touches no target file. Otherwise source and target
//! are outer-joined with presence markers, and a lazy output stream applies
//! the per-row state machine (noop-copy / insert / matched-clause) while
//! counting what it did; the query runtime consumes that stream directly
//! into new data files.
//!
//! Phase C commits `Remove(touched) ++ Add(new)` (plus evolved metadata)
//! through the optimistic transaction, whose read-set was populated by
//! Phase A's file filtering.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use snafu::prelude::*;
use snafu::IntoError;

use crate::expr::{Expr, Scalar};
use crate::merge::{
    MatchedAction, MergeBuilder, MergeError, MergeMetrics, MergeRuntimeSnafu, MergeSchemaSnafu,
    MergeTxnSnafu, MultipleSourceMatchSnafu, NotMatchedClause,
};
use crate::runtime::local::{stream_from, table_row_schema};
use crate::runtime::{JoinKind, QueryRuntime, Row, RowSchema, RowStream, RuntimeError};
use crate::schema::assignments::{validate_insert_columns, validate_set_paths};
use crate::schema::{DataType, PrimitiveType, StructField, StructType};
use crate::transaction::{DeltaOperation, OptimisticTransaction};
use crate::transaction_log::actions::{Action, AddFile, RemoveFile};
use crate::transaction_log::log_store::Version;

const FILE_COLUMN: &str = "__file";
const ROW_ID_COLUMN: &str = "__rid";
const SOURCE_PRESENT_COLUMN: &str = "__source_present";
const TARGET_PRESENT_COLUMN: &str = "__target_present";

/// Rewrite alias-qualified column references (`t.k`) to bare names (`k`).
fn strip_alias(expr: &Expr, alias: &str) -> Expr {
    let prefix = format!("{alias}.");
    let rename = |name: &str| {
        name.strip_prefix(&prefix)
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string())
    };
    map_columns(expr, &rename)
}

fn map_columns(expr: &Expr, rename: &impl Fn(&str) -> String) -> Expr {
    match expr {
        Expr::Literal(v) => Expr::Literal(v.clone()),
        Expr::Column(name) => Expr::Column(rename(name)),
        Expr::Cmp { op, left, right } => Expr::Cmp {
            op: *op,
            left: Box::new(map_columns(left, rename)),
            right: Box::new(map_columns(right, rename)),
        },
        Expr::NullSafeEq(left, right) => Expr::NullSafeEq(
            Box::new(map_columns(left, rename)),
            Box::new(map_columns(right, rename)),
        ),
        Expr::Arith { op, left, right } => Expr::Arith {
            op: *op,
            left: Box::new(map_columns(left, rename)),
            right: Box::new(map_columns(right, rename)),
        },
        Expr::And(left, right) => Expr::And(
            Box::new(map_columns(left, rename)),
            Box::new(map_columns(right, rename)),
        ),
        Expr::Or(left, right) => Expr::Or(
            Box::new(map_columns(left, rename)),
            Box::new(map_columns(right, rename)),
        ),
        Expr::Not(inner) => Expr::Not(Box::new(map_columns(inner, rename))),
        Expr::IsNull(inner) => Expr::IsNull(Box::new(map_columns(inner, rename))),
    }
}

/// Widen the target schema with source-only columns (appended nullable).
///
/// Column types for new columns are inferred from the source rows; columns
/// the target already has keep their target type.
fn evolve_schema(
    target: &StructType,
    source_columns: &[String],
    source_rows: &[Row],
) -> Result<StructType, MergeError> {
    let mut fields = target.fields.clone();
    for column in source_columns {
        if target.field(column).is_none() {
            let data_type = infer_column_type(column, source_rows);
            fields.push(StructField::new(column.clone(), data_type, true));
        }
    }
    StructType::new(fields).context(MergeSchemaSnafu)
}

fn infer_column_type(column: &str, rows: &[Row]) -> DataType {
    for row in rows {
        match row.get(column) {
            Some(Scalar::Long(_)) => return DataType::primitive(PrimitiveType::Long),
            Some(Scalar::Double(_)) => return DataType::primitive(PrimitiveType::Double),
            Some(Scalar::Boolean(_)) => return DataType::primitive(PrimitiveType::Boolean),
            Some(Scalar::String(_)) => return DataType::primitive(PrimitiveType::String),
            Some(Scalar::Null) | None => continue,
        }
    }
    DataType::primitive(PrimitiveType::String)
}

fn expr_err(e: crate::expr::ExprError) -> RuntimeError {
    crate::runtime::RuntimeExprSnafu.into_error(e)
}

/// Copy the target side of a joined row into the output shape; evolved
/// columns the target never had come out NULL.
fn copy_target(row: &Row, target_alias: &str, out: &Arc<RowSchema>) -> Row {
    let values = out
        .names()
        .iter()
        .map(|column| {
            row.get(&format!("{target_alias}.{column}"))
                .cloned()
                .unwrap_or(Scalar::Null)
        })
        .collect();
    Row::new(out.clone(), values)
}

fn build_insert(
    row: &Row,
    values: &HashMap<String, Expr>,
    out: &Arc<RowSchema>,
) -> Result<Row, RuntimeError> {
    let mut out_values = Vec::with_capacity(out.len());
    for column in out.names() {
        let value = match values.get(column) {
            Some(expr) => expr.eval(row).map_err(expr_err)?,
            None => Scalar::Null,
        };
        out_values.push(value);
    }
    Ok(Row::new(out.clone(), out_values))
}

#[derive(Debug, Default)]
struct OutputCounts {
    copied: usize,
    updated: usize,
    inserted: usize,
    deleted: usize,
}

/// Lazy per-row state machine over the outer-join stream.
struct MergeOutput {
    inner: RowStream,
    matched: Vec<crate::merge::MatchedClause>,
    not_matched: Vec<NotMatchedClause>,
    target_alias: String,
    out_schema: Arc<RowSchema>,
    counts: Arc<Mutex<OutputCounts>>,
}

impl MergeOutput {
    fn bump(&self, f: impl FnOnce(&mut OutputCounts)) {
        if let Ok(mut counts) = self.counts.lock() {
            f(&mut counts);
        }
    }

    fn process(&self, row: &Row) -> Result<Option<Row>, RuntimeError> {
        let source_present =
            matches!(row.get(SOURCE_PRESENT_COLUMN), Some(Scalar::Boolean(true)));
        let target_present =
            matches!(row.get(TARGET_PRESENT_COLUMN), Some(Scalar::Boolean(true)));

        if !source_present {
            // Target row no source row matched: carried through unchanged.
            self.bump(|c| c.copied += 1);
            return Ok(Some(copy_target(row, &self.target_alias, &self.out_schema)));
        }

        if !target_present {
            for clause in &self.not_matched {
                let fires = match &clause.predicate {
                    None => true,
                    Some(p) => p.eval_predicate(row).map_err(expr_err)?,
                };
                if fires {
                    self.bump(|c| c.inserted += 1);
                    return build_insert(row, &clause.values, &self.out_schema).map(Some);
                }
            }
            return Ok(None);
        }

        for clause in &self.matched {
            let fires = match &clause.predicate {
                None => true,
                Some(p) => p.eval_predicate(row).map_err(expr_err)?,
            };
            if !fires {
                continue;
            }
            return match &clause.action {
                MatchedAction::Delete => {
                    self.bump(|c| c.deleted += 1);
                    Ok(None)
                }
                MatchedAction::Update { set } => {
                    let mut updated = copy_target(row, &self.target_alias, &self.out_schema);
                    let schema = updated.schema().clone();
                    let mut values = updated.into_values();
                    for (column, expr) in set {
                        if let Some(position) = schema.position(column) {
                            values[position] = expr.eval(row).map_err(expr_err)?;
                        }
                    }
                    updated = Row::new(schema, values);
                    self.bump(|c| c.updated += 1);
                    Ok(Some(updated))
                }
            };
        }

        // Matched row satisfying no matched clause: copy through.
        self.bump(|c| c.copied += 1);
        Ok(Some(copy_target(row, &self.target_alias, &self.out_schema)))
    }
}

impl Iterator for MergeOutput {
    type Item = Result<Row, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Err(e) => return Some(Err(e)),
                Ok(row) => match self.process(&row) {
                    Err(e) => return Some(Err(e)),
                    Ok(Some(out)) => return Some(Ok(out)),
                    Ok(None) => continue,
                },
            }
        }
    }
}

/// Lazy insert-only output over the LEFT ANTI stream.
struct InsertOnlyOutput {
    inner: RowStream,
    clause: NotMatchedClause,
    out_schema: Arc<RowSchema>,
    counts: Arc<Mutex<OutputCounts>>,
}

impl Iterator for InsertOnlyOutput {
    type Item = Result<Row, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Err(e) => return Some(Err(e)),
                Ok(row) => {
                    let fires = match &self.clause.predicate {
                        None => true,
                        Some(p) => match p.eval_predicate(&row).map_err(expr_err) {
                            Ok(fires) => fires,
                            Err(e) => return Some(Err(e)),
                        },
                    };
                    if !fires {
                        continue;
                    }
                    if let Ok(mut counts) = self.counts.lock() {
                        counts.inserted += 1;
                    }
                    return Some(build_insert(&row, &self.clause.values, &self.out_schema));
                }
            }
        }
    }
}

pub(super) async fn run(
    builder: MergeBuilder,
    runtime: &dyn QueryRuntime,
) -> Result<(Version, MergeMetrics), MergeError> {
    let unambiguous_delete = builder.is_unambiguous_delete();
    let MergeBuilder {
        store,
        snapshot,
        source_columns,
        source_rows,
        condition,
        matched,
        not_matched,
        source_alias,
        target_alias,
        schema_evolution,
    } = builder;

    let config = snapshot.config();
    let evolution = schema_evolution.unwrap_or(config.auto_merge_schema);
    let target_schema = snapshot.schema().context(MergeSchemaSnafu)?;
    let partition_columns = snapshot.partition_columns().to_vec();

    let evolved_schema = if evolution {
        evolve_schema(&target_schema, &source_columns, &source_rows)?
    } else {
        target_schema.clone()
    };

    for clause in &matched {
        if let MatchedAction::Update { set } = &clause.action {
            validate_set_paths(&evolved_schema, set.keys().map(String::as_str))
                .context(MergeSchemaSnafu)?;
        }
    }
    for clause in &not_matched {
        validate_insert_columns(&evolved_schema, clause.values.keys().map(String::as_str))
            .context(MergeSchemaSnafu)?;
    }

    let mut metrics = MergeMetrics {
        num_source_rows: source_rows.len(),
        num_target_files_before_skipping: snapshot.num_files(),
        ..MergeMetrics::default()
    };

    let mut txn = OptimisticTransaction::new(store.clone(), snapshot);

    // ---- Phase A: find touched files ----------------------------------

    let target_prefix = format!("{target_alias}.");
    let target_only_predicates: Vec<Expr> = condition
        .split_conjuncts()
        .into_iter()
        .filter(|c| c.references_only(|name| name.starts_with(&target_prefix)))
        .map(|c| strip_alias(c, &target_alias))
        .collect();

    let skipped_files = txn
        .filter_files(&target_only_predicates)
        .context(MergeTxnSnafu)?;
    metrics.num_target_files_after_skipping = skipped_files.len();

    let source_schema = Arc::new(RowSchema::qualified(
        &source_alias,
        source_columns.iter().map(String::as_str),
    ));
    let qualified_source: Vec<Row> = source_rows
        .iter()
        .map(|r| r.with_schema(source_schema.clone()))
        .collect();

    let tagged_schema = Arc::new(RowSchema::new(
        target_schema
            .field_names()
            .map(|n| format!("{target_alias}.{n}"))
            .chain([FILE_COLUMN.to_string(), ROW_ID_COLUMN.to_string()])
            .collect(),
    ));
    let mut tagged_target: Vec<Row> = Vec::new();
    {
        let mut row_id: i64 = 0;
        for file in &skipped_files {
            let stream = runtime
                .scan(
                    store.location(),
                    std::slice::from_ref(file),
                    &target_schema,
                    None,
                )
                .context(MergeRuntimeSnafu)?;
            for row in stream {
                let row = row.context(MergeRuntimeSnafu)?;
                let mut values = row.into_values();
                values.push(Scalar::String(file.path.clone()));
                values.push(Scalar::Long(row_id));
                tagged_target.push(Row::new(tagged_schema.clone(), values));
                row_id += 1;
            }
        }
    }

    let find_join = runtime
        .join(
            stream_from(qualified_source.clone()),
            source_schema.clone(),
            stream_from(tagged_target.clone()),
            tagged_schema.clone(),
            &condition,
            JoinKind::Inner,
        )
        .context(MergeRuntimeSnafu)?;

    let mut match_counts: HashMap<i64, u64> = HashMap::new();
    let mut touched_paths: BTreeSet<String> = BTreeSet::new();
    for row in find_join {
        let row = row.context(MergeRuntimeSnafu)?;
        if let Some(Scalar::Long(rid)) = row.get(ROW_ID_COLUMN) {
            *match_counts.entry(*rid).or_insert(0) += 1;
        }
        if let Some(Scalar::String(path)) = row.get(FILE_COLUMN) {
            touched_paths.insert(path.clone());
        }
    }

    let worst = match_counts.values().copied().max().unwrap_or(0);
    if worst > 1 && !unambiguous_delete {
        return MultipleSourceMatchSnafu { count: worst }.fail();
    }

    let touched_files: Vec<AddFile> = skipped_files
        .iter()
        .filter(|f| touched_paths.contains(&f.path))
        .cloned()
        .collect();

    // ---- Phase B: write new files -------------------------------------

    let out_schema = Arc::new(table_row_schema(&evolved_schema));
    let counts = Arc::new(Mutex::new(OutputCounts::default()));

    let insert_only =
        matched.is_empty() && not_matched.len() == 1 && config.merge_insert_only;

    let (added, removed): (Vec<AddFile>, Vec<RemoveFile>) = if insert_only {
        let anti = runtime
            .join(
                stream_from(qualified_source),
                source_schema,
                stream_from(tagged_target),
                tagged_schema,
                &condition,
                JoinKind::LeftAnti,
            )
            .context(MergeRuntimeSnafu)?;

        let output = InsertOnlyOutput {
            inner: anti,
            clause: not_matched.into_iter().next().unwrap_or(NotMatchedClause {
                predicate: None,
                values: HashMap::new(),
            }),
            out_schema: out_schema.clone(),
            counts: counts.clone(),
        };

        let added = runtime
            .write(
                store.location(),
                Box::new(output),
                &evolved_schema,
                &partition_columns,
            )
            .context(MergeRuntimeSnafu)?;
        (added, Vec::new())
    } else {
        let marked_source_schema = Arc::new(RowSchema::new(
            source_schema
                .names()
                .iter()
                .cloned()
                .chain([SOURCE_PRESENT_COLUMN.to_string()])
                .collect(),
        ));
        let marked_source: Vec<Row> = qualified_source
            .into_iter()
            .map(|r| {
                let mut values = r.into_values();
                values.push(Scalar::Boolean(true));
                Row::new(marked_source_schema.clone(), values)
            })
            .collect();

        let marked_target_schema = Arc::new(RowSchema::new(
            tagged_schema
                .names()
                .iter()
                .cloned()
                .chain([TARGET_PRESENT_COLUMN.to_string()])
                .collect(),
        ));
        let marked_target: Vec<Row> = tagged_target
            .into_iter()
            .filter(|r| match r.get(FILE_COLUMN) {
                Some(Scalar::String(path)) => touched_paths.contains(path),
                _ => false,
            })
            .map(|r| {
                let mut values = r.into_values();
                values.push(Scalar::Boolean(true));
                Row::new(marked_target_schema.clone(), values)
            })
            .collect();

        let join_kind = if not_matched.is_empty() && config.merge_matched_only {
            JoinKind::RightOuter
        } else {
            JoinKind::FullOuter
        };

        let joined = runtime
            .join(
                stream_from(marked_source),
                marked_source_schema,
                stream_from(marked_target),
                marked_target_schema,
                &condition,
                join_kind,
            )
            .context(MergeRuntimeSnafu)?;

        let output = MergeOutput {
            inner: joined,
            matched,
            not_matched,
            target_alias: target_alias.clone(),
            out_schema: out_schema.clone(),
            counts: counts.clone(),
        };

        let added = runtime
            .write(
                store.location(),
                Box::new(output),
                &evolved_schema,
                &partition_columns,
            )
            .context(MergeRuntimeSnafu)?;

        let removed = touched_files
            .iter()
            .map(|f| RemoveFile::new(f.path.clone()))
            .collect();
        (added, removed)
    };

    {
        let counts = counts.lock().unwrap_or_else(|e| e.into_inner());
        metrics.num_target_rows_copied = counts.copied;
        metrics.num_target_rows_updated = counts.updated;
        metrics.num_target_rows_inserted = counts.inserted;
        metrics.num_target_rows_deleted = counts.deleted;
    }
    metrics.num_target_files_removed = removed.len();
    metrics.num_target_files_added = added.len();

    // ---- Phase C: commit ----------------------------------------------

    let mut actions: Vec<Action> = Vec::new();
    if evolved_schema != target_schema {
        let mut metadata = txn.snapshot().metadata.clone();
        metadata.schema_string = evolved_schema.to_json().context(MergeSchemaSnafu)?;
        actions.push(Action::Metadata(metadata));
    }
    actions.extend(removed.into_iter().map(Action::Remove));
    actions.extend(added.into_iter().map(Action::Add));

    let version = txn
        .commit_with_metrics(
            actions,
            DeltaOperation::Merge {
                predicate: condition,
            },
            metrics.to_map(),
        )
        .await
        .context(MergeTxnSnafu)?;

    Ok((version, metrics))
}
