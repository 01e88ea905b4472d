//! Validation of SET / INSERT assignment paths.
//!
//! MERGE and UPDATE accept `SET col.path = expr` maps. Before any data is
//! touched the paths are checked against the target schema:
//!
//! - only struct components may be traversed,
//! - no two assignments may overlap (same leaf, or one a prefix of the
//!   other),
//! - INSERT value maps are flat: nested paths are rejected outright.

use crate::schema::{
    ConflictingAssignmentsSnafu, NestedFieldInInsertSnafu, SchemaError, StructType,
};

fn paths_overlap(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long.as_bytes()[short.len()] == b'.')
}

/// Validate the assignment paths of an UPDATE / matched-UPDATE clause.
///
/// Each path must resolve through the schema (struct traversal only) and no
/// two paths may overlap.
pub fn validate_set_paths<'a>(
    schema: &StructType,
    paths: impl IntoIterator<Item = &'a str>,
) -> Result<(), SchemaError> {
    let mut seen: Vec<&str> = Vec::new();

    for path in paths {
        schema.field_at_path(path)?;

        if let Some(prior) = seen.iter().find(|p| paths_overlap(p, path)) {
            return ConflictingAssignmentsSnafu {
                first: prior.to_string(),
                second: path.to_string(),
            }
            .fail();
        }
        seen.push(path);
    }
    Ok(())
}

/// Validate the value map of an INSERT clause: flat top-level columns only.
pub fn validate_insert_columns<'a>(
    schema: &StructType,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<(), SchemaError> {
    for column in columns {
        if column.contains('.') {
            return NestedFieldInInsertSnafu { path: column }.fail();
        }
        schema.field_at_path(column)?;
    }
    Ok(())
}
