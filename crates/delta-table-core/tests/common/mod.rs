//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use delta_table_core::expr::Scalar;
use delta_table_core::runtime::local::table_row_schema;
use delta_table_core::runtime::{LocalRuntime, QueryRuntime, Row, RowSchema};
use delta_table_core::schema::{DataType, PrimitiveType, StructField, StructType};
use delta_table_core::storage::TableLocation;
use delta_table_core::table::DeltaTable;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// A `(name, type, nullable)` triple list into a schema.
pub fn schema_of(fields: &[(&str, PrimitiveType, bool)]) -> StructType {
    StructType::new(
        fields
            .iter()
            .map(|(name, primitive, nullable)| {
                StructField::new(*name, DataType::primitive(*primitive), *nullable)
            })
            .collect(),
    )
    .expect("valid test schema")
}

/// Rows over named columns from scalar tuples.
pub fn rows_of(columns: &[&str], data: Vec<Vec<Scalar>>) -> Vec<Row> {
    let schema = Arc::new(RowSchema::new(
        columns.iter().map(|c| c.to_string()).collect(),
    ));
    data.into_iter()
        .map(|values| Row::new(schema.clone(), values))
        .collect()
}

/// Shorthand scalar constructors.
pub fn long(v: i64) -> Scalar {
    Scalar::Long(v)
}

pub fn null() -> Scalar {
    Scalar::Null
}

pub fn text(v: &str) -> Scalar {
    Scalar::String(v.to_string())
}

/// Create a fresh table under a temp dir.
pub async fn create_table(
    schema: StructType,
    partition_columns: Vec<String>,
    configuration: HashMap<String, String>,
) -> (TempDir, DeltaTable) {
    let tmp = TempDir::new().expect("create temp dir");
    let table = DeltaTable::create(
        TableLocation::local(tmp.path()),
        schema,
        partition_columns,
        configuration,
    )
    .await
    .expect("create table");
    (tmp, table)
}

/// Every live row of the table, as value vectors sorted for comparison.
pub async fn table_contents(table: &DeltaTable, runtime: &LocalRuntime) -> Vec<Vec<Scalar>> {
    let snapshot = table.log().update().await.expect("refresh snapshot");
    let schema = snapshot.schema().expect("snapshot schema");
    let files: Vec<_> = snapshot.files.values().cloned().collect();

    let mut rows: Vec<Vec<Scalar>> = runtime
        .scan(table.log().location(), &files, &schema, None)
        .expect("scan")
        .collect::<Result<Vec<Row>, _>>()
        .expect("rows")
        .into_iter()
        .map(Row::into_values)
        .collect();
    rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    rows
}

/// Sort scalar tuples the same way `table_contents` does.
pub fn sorted(mut rows: Vec<Vec<Scalar>>) -> Vec<Vec<Scalar>> {
    rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    rows
}

/// The row schema of a table schema, for building typed rows.
pub fn row_schema(schema: &StructType) -> Arc<RowSchema> {
    Arc::new(table_row_schema(schema))
}
