//! The query-runtime capability boundary.
//!
//! The core never reads or writes columnar data itself; it tracks file
//! metadata and asks an external engine to scan, join, and materialize
//! rows. This module defines that narrow seam:
//!
//! - [`Row`] / [`RowSchema`]: a by-name row representation shared with the
//!   expression evaluator.
//! - [`RowStream`]: pull-based lazy iteration. The producer owns its state,
//!   the consumer drives; there are no callbacks.
//! - [`QueryRuntime`]: scan / join / write. Implementations decide file
//!   sizing, parallelism, and physical formats.
//!
//! Log and transaction I/O stays async; the data plane is synchronous
//! iterators, which is what a bulk-synchronous engine naturally presents to
//! a driver.

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use snafu::{Backtrace, prelude::*};

use crate::expr::{Expr, ExprError, Scalar};
use crate::schema::StructType;
use crate::storage::{StorageError, TableLocation};
use crate::transaction_log::actions::AddFile;

pub use local::LocalRuntime;

/// Ordered column names with by-name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSchema {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl RowSchema {
    /// Build a schema from column names.
    pub fn new(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self { names, index }
    }

    /// Build a schema with every name prefixed (`s.key`).
    pub fn qualified(prefix: &str, names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self::new(
            names
                .into_iter()
                .map(|n| format!("{prefix}.{}", n.as_ref()))
                .collect(),
        )
    }

    /// Concatenate two schemas (joined row shape).
    pub fn concat(&self, other: &RowSchema) -> Self {
        let mut names = self.names.clone();
        names.extend(other.names.iter().cloned());
        Self::new(names)
    }

    /// Column names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a column.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

/// A materialized row: a schema plus one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<RowSchema>,
    values: Vec<Scalar>,
}

impl Row {
    /// Build a row. The value count must match the schema width.
    pub fn new(schema: Arc<RowSchema>, values: Vec<Scalar>) -> Self {
        debug_assert_eq!(schema.len(), values.len());
        Self { schema, values }
    }

    /// The row's schema.
    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    /// Value by column name.
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.schema.position(name).map(|i| &self.values[i])
    }

    /// Values in schema order.
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    /// Consume the row into its values.
    pub fn into_values(self) -> Vec<Scalar> {
        self.values
    }

    /// A copy of this row under a different schema of the same width.
    pub fn with_schema(&self, schema: Arc<RowSchema>) -> Row {
        Row::new(schema, self.values.clone())
    }

    /// Concatenate two rows (used to form join output).
    pub fn concat(schema: Arc<RowSchema>, left: &Row, right: &Row) -> Row {
        let mut values = Vec::with_capacity(left.values.len() + right.values.len());
        values.extend(left.values.iter().cloned());
        values.extend(right.values.iter().cloned());
        Row::new(schema, values)
    }

    /// A row of the given width filled with NULL.
    pub fn nulls(schema: Arc<RowSchema>) -> Row {
        let width = schema.len();
        Row::new(schema, vec![Scalar::Null; width])
    }
}

/// Errors surfaced by query-runtime implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RuntimeError {
    /// Storage failure while reading or writing data files.
    #[snafu(display("Storage error in query runtime: {source}"))]
    RuntimeStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A row failed to encode or decode.
    #[snafu(display("Row codec error in {path}: {source}"))]
    RowCodec {
        /// The data file involved.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Expression evaluation failed mid-stream.
    #[snafu(display("Expression error in query runtime: {source}"))]
    RuntimeExpr {
        /// Underlying expression error.
        source: ExprError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The rows do not fit the schema they are written under.
    #[snafu(display("Row does not match schema: {msg}"))]
    RowShape {
        /// What was wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// A pull-based lazy stream of rows.
pub type RowStream = Box<dyn Iterator<Item = Result<Row, RuntimeError>> + Send>;

/// Join flavors the MERGE engine requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Rows matching on both sides.
    Inner,
    /// All right rows; unmatched get NULL left columns.
    RightOuter,
    /// All rows from both sides.
    FullOuter,
    /// Left rows with no right match, left columns only.
    LeftAnti,
}

/// What the core requires from the execution layer.
///
/// Implementations run wherever they like (the bundled [`LocalRuntime`] is
/// single-process); the core only observes iterators and the `AddFile`
/// entries a write produced.
pub trait QueryRuntime: Send + Sync {
    /// Scan `files` under `root`, yielding rows shaped by `schema`.
    ///
    /// `predicate` is a row-level filter the engine may apply; passing it
    /// here is an optimization, correctness never depends on it.
    fn scan(
        &self,
        root: &TableLocation,
        files: &[AddFile],
        schema: &StructType,
        predicate: Option<&Expr>,
    ) -> Result<RowStream, RuntimeError>;

    /// Join two streams on `condition`.
    ///
    /// The output schema is `left_schema ++ right_schema`; the absent side
    /// of an outer join is NULL-filled (`LeftAnti` output is left-only).
    fn join(
        &self,
        left: RowStream,
        left_schema: Arc<RowSchema>,
        right: RowStream,
        right_schema: Arc<RowSchema>,
        condition: &Expr,
        kind: JoinKind,
    ) -> Result<RowStream, RuntimeError>;

    /// Materialize `rows` as data files under `root`, partitioned by
    /// `partition_columns`, and return their `AddFile` entries (stats
    /// included). The producer decides file sizing.
    fn write(
        &self,
        root: &TableLocation,
        rows: RowStream,
        schema: &StructType,
        partition_columns: &[String],
    ) -> Result<Vec<AddFile>, RuntimeError>;
}
