//! Bundled single-process query runtime.
//!
//! Data files are newline-delimited JSON, one object per row, written under
//! Hive-style partition directories. This is not a performance engine; it
//! exists so the core is exercisable end-to-end (and testable) without a
//! cluster, and it honors the same contract a distributed engine would:
//! stats on write, predicate pushdown as an optimization only, lazy
//! pull-based streams, NULL-filled outer joins.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Number, Value};
use snafu::prelude::*;
use snafu::IntoError;

use crate::expr::{Expr, Scalar};
use crate::index::parse_partition_scalar;
use crate::runtime::{
    JoinKind, QueryRuntime, Row, RowCodecSnafu, RowSchema, RowShapeSnafu, RowStream, RuntimeError,
    RuntimeExprSnafu,
};
use crate::schema::{DataType, PrimitiveType, StructType};
use crate::storage::TableLocation;
use crate::transaction_log::actions::AddFile;

/// Directory name Hive uses for a NULL partition value.
pub const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The bundled runtime. Stateless; cheap to construct.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRuntime;

impl LocalRuntime {
    /// A new local runtime.
    pub fn new() -> Self {
        Self
    }
}

/// Wrap already-materialized rows as a stream.
pub fn stream_from(rows: Vec<Row>) -> RowStream {
    Box::new(rows.into_iter().map(Ok))
}

/// The row shape of a table schema (top-level column names).
pub fn table_row_schema(schema: &StructType) -> RowSchema {
    RowSchema::new(schema.field_names().map(str::to_string).collect())
}

fn local_root(root: &TableLocation) -> PathBuf {
    let TableLocation::Local(path) = root;
    path.clone()
}

fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Boolean(v) => Value::Bool(*v),
        Scalar::Long(v) => Value::Number((*v).into()),
        Scalar::Double(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
        Scalar::String(v) => Value::String(v.clone()),
    }
}

fn scalar_from_json(value: &Value, data_type: Option<&DataType>) -> Scalar {
    match value {
        Value::Null => Scalar::Null,
        Value::Bool(v) => Scalar::Boolean(*v),
        Value::Number(n) => match data_type {
            Some(DataType::Primitive(
                PrimitiveType::Float | PrimitiveType::Double,
            )) => Scalar::Double(n.as_f64().unwrap_or_default()),
            _ => match n.as_i64() {
                Some(v) => Scalar::Long(v),
                None => Scalar::Double(n.as_f64().unwrap_or_default()),
            },
        },
        Value::String(v) => Scalar::String(v.clone()),
        other => Scalar::String(other.to_string()),
    }
}

/// Render a partition value the way it is stored in `partitionValues`.
pub fn partition_value_string(value: &Scalar) -> Option<String> {
    match value {
        Scalar::Null => None,
        Scalar::Boolean(v) => Some(v.to_string()),
        Scalar::Long(v) => Some(v.to_string()),
        Scalar::Double(v) => Some(v.to_string()),
        Scalar::String(v) => Some(v.clone()),
    }
}

struct ScanState {
    root: PathBuf,
    files: VecDeque<AddFile>,
    schema: Arc<RowSchema>,
    column_types: Vec<Option<DataType>>,
    predicate: Option<Expr>,
    current: Option<(String, std::io::Lines<BufReader<fs::File>>, AddFile)>,
}

impl ScanState {
    fn open_next(&mut self) -> Result<bool, RuntimeError> {
        match self.files.pop_front() {
            None => Ok(false),
            Some(add) => {
                let abs = self.root.join(&add.path);
                let file = fs::File::open(&abs).map_err(|e| {
                    crate::storage::StorageError::LocalIo {
                        path: abs.display().to_string(),
                        source: e,
                        backtrace: snafu::Backtrace::capture(),
                    }
                })
                .context(crate::runtime::RuntimeStorageSnafu)?;
                self.current = Some((add.path.clone(), BufReader::new(file).lines(), add));
                Ok(true)
            }
        }
    }

    fn row_from_line(&self, path: &str, add: &AddFile, line: &str) -> Result<Row, RuntimeError> {
        let object: Map<String, Value> =
            serde_json::from_str(line).context(RowCodecSnafu { path })?;

        let mut values = Vec::with_capacity(self.schema.len());
        for (i, name) in self.schema.names().iter().enumerate() {
            let value = match object.get(name) {
                Some(v) => scalar_from_json(v, self.column_types[i].as_ref()),
                // A column the file predates (schema evolution) or a
                // partition column carried only in file metadata.
                None => match add.partition_values.get(name) {
                    Some(Some(v)) => parse_partition_scalar(v, self.column_types[i].as_ref()),
                    _ => Scalar::Null,
                },
            };
            values.push(value);
        }
        Ok(Row::new(self.schema.clone(), values))
    }
}

impl Iterator for ScanState {
    type Item = Result<Row, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next() {
                    Ok(false) => return None,
                    Ok(true) => {}
                    Err(e) => return Some(Err(e)),
                }
            }

            let (path, lines, add) = self.current.as_mut()?;
            match lines.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Err(e)) => {
                    let err = crate::storage::StorageError::LocalIo {
                        path: path.clone(),
                        source: e,
                        backtrace: snafu::Backtrace::capture(),
                    };
                    self.current = None;
                    return Some(Err(RuntimeError::RuntimeStorage { source: err }));
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let path = path.clone();
                    let add = add.clone();
                    let row = match self.row_from_line(&path, &add, &line) {
                        Ok(row) => row,
                        Err(e) => return Some(Err(e)),
                    };
                    if let Some(predicate) = &self.predicate {
                        match predicate.eval_predicate(&row) {
                            Ok(true) => return Some(Ok(row)),
                            Ok(false) => continue,
                            Err(e) => {
                                return Some(Err(
                                    RuntimeExprSnafu.into_error(e),
                                ));
                            }
                        }
                    }
                    return Some(Ok(row));
                }
            }
        }
    }
}

struct NestedLoopJoin {
    left: RowStream,
    right: Vec<Row>,
    right_matched: Vec<bool>,
    left_schema: Arc<RowSchema>,
    right_schema: Arc<RowSchema>,
    output_schema: Arc<RowSchema>,
    condition: Expr,
    kind: JoinKind,
    pending: VecDeque<Row>,
    left_exhausted: bool,
    right_tail_idx: usize,
}

impl NestedLoopJoin {
    fn process_left_row(&mut self, left_row: &Row) -> Result<(), RuntimeError> {
        let mut matched = false;
        for (i, right_row) in self.right.iter().enumerate() {
            let candidate = Row::concat(self.output_schema.clone(), left_row, right_row);
            let holds = self
                .condition
                .eval_predicate(&candidate)
                .map_err(|e| RuntimeExprSnafu.into_error(e))?;
            if holds {
                matched = true;
                self.right_matched[i] = true;
                if !matches!(self.kind, JoinKind::LeftAnti) {
                    self.pending.push_back(candidate);
                }
            }
        }

        match self.kind {
            JoinKind::LeftAnti => {
                if !matched {
                    self.pending.push_back(left_row.clone());
                }
            }
            JoinKind::FullOuter => {
                if !matched {
                    let null_right = Row::nulls(self.right_schema.clone());
                    self.pending.push_back(Row::concat(
                        self.output_schema.clone(),
                        left_row,
                        &null_right,
                    ));
                }
            }
            JoinKind::Inner | JoinKind::RightOuter => {}
        }
        Ok(())
    }

    fn next_right_tail(&mut self) -> Option<Row> {
        if !matches!(self.kind, JoinKind::RightOuter | JoinKind::FullOuter) {
            return None;
        }
        while self.right_tail_idx < self.right.len() {
            let i = self.right_tail_idx;
            self.right_tail_idx += 1;
            if !self.right_matched[i] {
                let null_left = Row::nulls(self.left_schema.clone());
                return Some(Row::concat(
                    self.output_schema.clone(),
                    &null_left,
                    &self.right[i],
                ));
            }
        }
        None
    }
}

impl Iterator for NestedLoopJoin {
    type Item = Result<Row, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(Ok(row));
            }
            if self.left_exhausted {
                return self.next_right_tail().map(Ok);
            }
            match self.left.next() {
                None => {
                    self.left_exhausted = true;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(left_row)) => {
                    if let Err(e) = self.process_left_row(&left_row) {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct ColumnStats {
    min: Option<Scalar>,
    max: Option<Scalar>,
    null_count: i64,
}

impl ColumnStats {
    fn observe(&mut self, value: &Scalar) {
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        let replace_min = match &self.min {
            None => true,
            Some(current) => value.compare(current) == Some(std::cmp::Ordering::Less),
        };
        if replace_min {
            self.min = Some(value.clone());
        }
        let replace_max = match &self.max {
            None => true,
            Some(current) => value.compare(current) == Some(std::cmp::Ordering::Greater),
        };
        if replace_max {
            self.max = Some(value.clone());
        }
    }
}

fn stats_json(num_records: i64, names: &[String], stats: &[ColumnStats]) -> String {
    let mut min_values = Map::new();
    let mut max_values = Map::new();
    let mut null_count = Map::new();
    for (name, s) in names.iter().zip(stats) {
        if let Some(min) = &s.min {
            min_values.insert(name.clone(), scalar_to_json(min));
        }
        if let Some(max) = &s.max {
            max_values.insert(name.clone(), scalar_to_json(max));
        }
        null_count.insert(name.clone(), Value::Number(s.null_count.into()));
    }

    Value::Object(Map::from_iter([
        ("numRecords".to_string(), Value::Number(num_records.into())),
        ("minValues".to_string(), Value::Object(min_values)),
        ("maxValues".to_string(), Value::Object(max_values)),
        ("nullCount".to_string(), Value::Object(null_count)),
    ]))
    .to_string()
}

impl QueryRuntime for LocalRuntime {
    fn scan(
        &self,
        root: &TableLocation,
        files: &[AddFile],
        schema: &StructType,
        predicate: Option<&Expr>,
    ) -> Result<RowStream, RuntimeError> {
        let row_schema = Arc::new(table_row_schema(schema));
        let column_types = schema
            .fields
            .iter()
            .map(|f| Some(f.data_type.clone()))
            .collect();

        Ok(Box::new(ScanState {
            root: local_root(root),
            files: files.iter().cloned().collect(),
            schema: row_schema,
            column_types,
            predicate: predicate.cloned(),
            current: None,
        }))
    }

    fn join(
        &self,
        left: RowStream,
        left_schema: Arc<RowSchema>,
        right: RowStream,
        right_schema: Arc<RowSchema>,
        condition: &Expr,
        kind: JoinKind,
    ) -> Result<RowStream, RuntimeError> {
        let right: Vec<Row> = right.collect::<Result<_, _>>()?;
        let right_matched = vec![false; right.len()];
        let output_schema = Arc::new(left_schema.concat(&right_schema));

        Ok(Box::new(NestedLoopJoin {
            left,
            right,
            right_matched,
            left_schema,
            right_schema,
            output_schema,
            condition: condition.clone(),
            kind,
            pending: VecDeque::new(),
            left_exhausted: false,
            right_tail_idx: 0,
        }))
    }

    fn write(
        &self,
        root: &TableLocation,
        rows: RowStream,
        schema: &StructType,
        partition_columns: &[String],
    ) -> Result<Vec<AddFile>, RuntimeError> {
        let names: Vec<String> = schema.field_names().map(str::to_string).collect();
        for partition_column in partition_columns {
            ensure!(
                names.iter().any(|n| n == partition_column),
                RowShapeSnafu {
                    msg: format!("partition column {partition_column} not in schema"),
                }
            );
        }

        // Group rows by partition tuple. BTreeMap keeps output deterministic.
        let mut groups: BTreeMap<Vec<Option<String>>, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let row = row?;
            ensure!(
                row.schema().len() == names.len(),
                RowShapeSnafu {
                    msg: format!(
                        "row width {} does not match schema width {}",
                        row.schema().len(),
                        names.len()
                    ),
                }
            );
            let key = partition_columns
                .iter()
                .map(|c| {
                    row.get(c)
                        .map(partition_value_string)
                        .unwrap_or_default()
                })
                .collect();
            groups.entry(key).or_default().push(row);
        }

        let root_path = local_root(root);
        let mut added = Vec::with_capacity(groups.len());

        for (partition_key, group_rows) in groups {
            let mut rel_dir = PathBuf::new();
            for (column, value) in partition_columns.iter().zip(&partition_key) {
                let rendered = value.as_deref().unwrap_or(NULL_PARTITION_VALUE);
                rel_dir.push(format!("{column}={rendered}"));
            }

            let nonce = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
            let file_name = format!(
                "part-{:05}-{:x}.json",
                nonce,
                Utc::now().timestamp_millis()
            );
            let rel_path = rel_dir.join(&file_name);
            let rel_path_str = rel_path.to_string_lossy().replace('\\', "/");

            let mut column_stats: Vec<ColumnStats> =
                names.iter().map(|_| ColumnStats::default()).collect();
            let mut payload = String::new();
            for row in &group_rows {
                let mut object = Map::new();
                for (i, name) in names.iter().enumerate() {
                    let value = row.get(name).unwrap_or(&Scalar::Null);
                    column_stats[i].observe(value);
                    object.insert(name.clone(), scalar_to_json(value));
                }
                payload.push_str(&Value::Object(object).to_string());
                payload.push('\n');
            }

            let abs = root_path.join(&rel_path);
            let io_error = |e: std::io::Error| {
                crate::runtime::RuntimeStorageSnafu.into_error(
                    crate::storage::StorageError::LocalIo {
                        path: abs.display().to_string(),
                        source: e,
                        backtrace: snafu::Backtrace::capture(),
                    },
                )
            };
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            let mut file = fs::File::create(&abs).map_err(io_error)?;
            file.write_all(payload.as_bytes()).map_err(io_error)?;
            file.sync_all().map_err(io_error)?;

            let mut add = AddFile::new(rel_path_str, payload.len() as i64).with_stats(stats_json(
                group_rows.len() as i64,
                &names,
                &column_stats,
            ));
            for (column, value) in partition_columns.iter().zip(&partition_key) {
                add = add.with_partition_value(column.clone(), value.clone());
            }
            added.push(add);
        }

        Ok(added)
    }
}
