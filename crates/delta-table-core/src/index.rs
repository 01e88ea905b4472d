//! File index: partition pruning and stats-based data skipping.
//!
//! Given predicates over table columns, narrow the snapshot's file set to
//! the candidates that might contain matching rows. Partition predicates
//! are exact (evaluated against `partitionValues` with SQL null semantics);
//! data predicates are evaluated three-valuedly against per-file min/max
//! ranges parsed lazily from the `stats` JSON.
//!
//! The truth value is universal over a file's rows, not "does the file
//! match": `AlwaysFalse` means no row can satisfy the predicate — only then
//! is a file skipped. Anything unprovable (missing stats, unsupported
//! expression shapes, parse failures) retains the file. Skipping is a
//! monotonic filter: disabling it may slow a query but can never change
//! its result.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::expr::{CmpOp, Expr, Scalar};
use crate::runtime::{Row, RowSchema};
use crate::schema::{DataType, PrimitiveType, StructType};
use crate::transaction_log::actions::AddFile;

/// Truth of a predicate over every row of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalTruth {
    /// True for all rows. Only asserted when the column has no NULLs.
    AlwaysTrue,
    /// True for no row. The file is safe to skip.
    AlwaysFalse,
    /// May hold for some rows; the file must be kept.
    MaybeTrue,
}

impl IntervalTruth {
    /// Conjunction.
    pub fn and(self, other: IntervalTruth) -> IntervalTruth {
        use IntervalTruth::*;
        match (self, other) {
            (AlwaysFalse, _) | (_, AlwaysFalse) => AlwaysFalse,
            (AlwaysTrue, AlwaysTrue) => AlwaysTrue,
            _ => MaybeTrue,
        }
    }

    /// Disjunction.
    pub fn or(self, other: IntervalTruth) -> IntervalTruth {
        use IntervalTruth::*;
        match (self, other) {
            (AlwaysTrue, _) | (_, AlwaysTrue) => AlwaysTrue,
            (AlwaysFalse, AlwaysFalse) => AlwaysFalse,
            _ => MaybeTrue,
        }
    }

    /// Negation.
    ///
    /// `AlwaysFalse` does not negate to `AlwaysTrue`: rows where the inner
    /// predicate evaluated to NULL select neither it nor its negation.
    pub fn not(self) -> IntervalTruth {
        use IntervalTruth::*;
        match self {
            AlwaysTrue => AlwaysFalse,
            AlwaysFalse | MaybeTrue => MaybeTrue,
        }
    }
}

/// Per-file statistics, parsed lazily from `AddFile.stats`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    /// Total row count.
    #[serde(default)]
    pub num_records: Option<i64>,
    /// Per-column minimum among non-null values.
    #[serde(default)]
    pub min_values: HashMap<String, Value>,
    /// Per-column maximum among non-null values.
    #[serde(default)]
    pub max_values: HashMap<String, Value>,
    /// Per-column null counts.
    #[serde(default)]
    pub null_count: HashMap<String, i64>,
}

impl FileStats {
    /// Parse the stats document of a file; `None` when absent or malformed
    /// (either way the file is retained).
    pub fn parse(add: &AddFile) -> Option<FileStats> {
        add.stats
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

fn json_to_scalar(value: &Value) -> Scalar {
    match value {
        Value::Null => Scalar::Null,
        Value::Bool(v) => Scalar::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => Scalar::Long(v),
            None => Scalar::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => Scalar::String(v.clone()),
        other => Scalar::String(other.to_string()),
    }
}

/// Parse a stored partition string back into a typed scalar.
pub fn parse_partition_scalar(raw: &str, data_type: Option<&DataType>) -> Scalar {
    match data_type {
        Some(DataType::Primitive(
            PrimitiveType::Byte
            | PrimitiveType::Short
            | PrimitiveType::Integer
            | PrimitiveType::Long,
        )) => raw.parse().map(Scalar::Long).unwrap_or(Scalar::Null),
        Some(DataType::Primitive(PrimitiveType::Float | PrimitiveType::Double)) => {
            raw.parse().map(Scalar::Double).unwrap_or(Scalar::Null)
        }
        Some(DataType::Primitive(PrimitiveType::Boolean)) => {
            raw.parse().map(Scalar::Boolean).unwrap_or(Scalar::Null)
        }
        _ => Scalar::String(raw.to_string()),
    }
}

/// Narrows a file set using predicates and per-file metadata.
#[derive(Debug)]
pub struct FileIndex<'a> {
    schema: &'a StructType,
    partition_columns: &'a [String],
    stats_skipping: bool,
}

impl<'a> FileIndex<'a> {
    /// Build an index over a table's schema and partitioning.
    pub fn new(
        schema: &'a StructType,
        partition_columns: &'a [String],
        stats_skipping: bool,
    ) -> Self {
        Self {
            schema,
            partition_columns,
            stats_skipping,
        }
    }

    fn is_partition_column(&self, name: &str) -> bool {
        self.partition_columns.iter().any(|c| c == name)
    }

    fn partition_row(&self, add: &AddFile) -> Row {
        let schema = Arc::new(RowSchema::new(self.partition_columns.to_vec()));
        let values = self
            .partition_columns
            .iter()
            .map(|column| {
                let data_type = self.schema.field(column).map(|f| &f.data_type);
                match add.partition_values.get(column) {
                    Some(Some(raw)) => parse_partition_scalar(raw, data_type),
                    _ => Scalar::Null,
                }
            })
            .collect();
        Row::new(schema, values)
    }

    /// The files surviving all predicates (implicitly ANDed).
    pub fn filter(
        &self,
        files: impl IntoIterator<Item = &'a AddFile>,
        predicates: &[Expr],
    ) -> Vec<AddFile> {
        let conjuncts: Vec<&Expr> = predicates
            .iter()
            .flat_map(|p| p.split_conjuncts())
            .collect();

        let (partition_conjuncts, rest): (Vec<&Expr>, Vec<&Expr>) = conjuncts
            .into_iter()
            .partition(|c| c.references_only(|name| self.is_partition_column(name)));
        // A conjunct mixing partition and data columns is unprovable from
        // either source alone; it simply retains.
        let data_conjuncts: Vec<&Expr> = rest
            .into_iter()
            .filter(|c| c.references_only(|name| !self.is_partition_column(name)))
            .collect();

        files
            .into_iter()
            .filter(|add| self.keep(add, &partition_conjuncts, &data_conjuncts))
            .cloned()
            .collect()
    }

    fn keep(&self, add: &AddFile, partition: &[&Expr], data: &[&Expr]) -> bool {
        if !partition.is_empty() {
            let row = self.partition_row(add);
            for conjunct in partition {
                // Exact evaluation; an eval error cannot prove exclusion.
                match conjunct.eval_predicate(&row) {
                    Ok(false) => return false,
                    Ok(true) | Err(_) => {}
                }
            }
        }

        if self.stats_skipping && !data.is_empty() {
            if let Some(stats) = FileStats::parse(add) {
                for conjunct in data {
                    if self.eval_interval(conjunct, &stats) == IntervalTruth::AlwaysFalse {
                        return false;
                    }
                }
            }
        }

        true
    }

    fn column_bounds(
        &self,
        stats: &FileStats,
        column: &str,
    ) -> (Option<Scalar>, Option<Scalar>, Option<i64>) {
        let min = stats.min_values.get(column).map(json_to_scalar);
        let max = stats.max_values.get(column).map(json_to_scalar);
        let nulls = stats.null_count.get(column).copied();
        (min, max, nulls)
    }

    fn eval_cmp(
        &self,
        op: CmpOp,
        column: &str,
        literal: &Scalar,
        stats: &FileStats,
    ) -> IntervalTruth {
        use IntervalTruth::*;
        use std::cmp::Ordering::*;

        if literal.is_null() {
            // A comparison with NULL selects nothing, but its negation
            // selects nothing either; three-valued intervals cannot express
            // that, so stay conservative.
            return MaybeTrue;
        }

        let (min, max, nulls) = self.column_bounds(stats, column);
        let (min, max) = match (min, max) {
            (Some(min), Some(max)) => (min, max),
            _ => return MaybeTrue,
        };
        let (min_ord, max_ord) = match (min.compare(literal), max.compare(literal)) {
            (Some(a), Some(b)) => (a, b),
            _ => return MaybeTrue,
        };

        let truth = match op {
            CmpOp::Lt => {
                if max_ord == Less {
                    AlwaysTrue
                } else if min_ord != Less {
                    AlwaysFalse
                } else {
                    MaybeTrue
                }
            }
            CmpOp::LtEq => {
                if max_ord != Greater {
                    AlwaysTrue
                } else if min_ord == Greater {
                    AlwaysFalse
                } else {
                    MaybeTrue
                }
            }
            CmpOp::Gt => {
                if min_ord == Greater {
                    AlwaysTrue
                } else if max_ord != Greater {
                    AlwaysFalse
                } else {
                    MaybeTrue
                }
            }
            CmpOp::GtEq => {
                if min_ord != Less {
                    AlwaysTrue
                } else if max_ord == Less {
                    AlwaysFalse
                } else {
                    MaybeTrue
                }
            }
            CmpOp::Eq => {
                if max_ord == Less || min_ord == Greater {
                    AlwaysFalse
                } else if min_ord == Equal && max_ord == Equal {
                    AlwaysTrue
                } else {
                    MaybeTrue
                }
            }
            CmpOp::NotEq => {
                if min_ord == Equal && max_ord == Equal {
                    AlwaysFalse
                } else if max_ord == Less || min_ord == Greater {
                    AlwaysTrue
                } else {
                    MaybeTrue
                }
            }
        };

        // NULL rows never satisfy a comparison, so a universal "true"
        // cannot be asserted unless the column is null-free.
        if truth == AlwaysTrue && nulls != Some(0) {
            MaybeTrue
        } else {
            truth
        }
    }

    fn eval_interval(&self, expr: &Expr, stats: &FileStats) -> IntervalTruth {
        use IntervalTruth::*;
        match expr {
            Expr::Literal(Scalar::Boolean(true)) => AlwaysTrue,
            Expr::Literal(Scalar::Boolean(false)) => AlwaysFalse,
            Expr::Literal(_) => MaybeTrue,

            Expr::Cmp { op, left, right } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(c), Expr::Literal(v)) => self.eval_cmp(*op, c, v, stats),
                (Expr::Literal(v), Expr::Column(c)) => self.eval_cmp(flip(*op), c, v, stats),
                _ => MaybeTrue,
            },

            Expr::NullSafeEq(left, right) => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(c), Expr::Literal(v)) | (Expr::Literal(v), Expr::Column(c)) => {
                    if v.is_null() {
                        self.eval_is_null(c, stats)
                    } else {
                        self.eval_cmp(CmpOp::Eq, c, v, stats)
                    }
                }
                _ => MaybeTrue,
            },

            Expr::IsNull(inner) => match inner.as_ref() {
                Expr::Column(c) => self.eval_is_null(c, stats),
                _ => MaybeTrue,
            },

            Expr::And(l, r) => self
                .eval_interval(l, stats)
                .and(self.eval_interval(r, stats)),
            Expr::Or(l, r) => self
                .eval_interval(l, stats)
                .or(self.eval_interval(r, stats)),
            Expr::Not(inner) => self.eval_interval(inner, stats).not(),

            Expr::Column(_) | Expr::Arith { .. } => MaybeTrue,
        }
    }

    fn eval_is_null(&self, column: &str, stats: &FileStats) -> IntervalTruth {
        use IntervalTruth::*;
        match (stats.null_count.get(column), stats.num_records) {
            (Some(0), _) => AlwaysFalse,
            (Some(n), Some(total)) if *n == total => AlwaysTrue,
            _ => MaybeTrue,
        }
    }
}

fn flip(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::LtEq => CmpOp::GtEq,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::GtEq => CmpOp::LtEq,
        CmpOp::Eq => CmpOp::Eq,
        CmpOp::NotEq => CmpOp::NotEq,
    }
}
