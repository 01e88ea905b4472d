//! Schema compatibility and evolution rules.
//!
//! Two distinct questions are answered here:
//!
//! - **Read compatibility** (streaming, time travel): may data written under
//!   `incoming` still be consumed by a reader that bound to `existing`?
//!   Adding nullable fields and widening numerics is fine; removing,
//!   renaming, or narrowing a field is not.
//! - **Evolution merge** (MERGE with `autoMerge.schema`): produce the widened
//!   union of target and source schemas, appending new source columns as
//!   nullable and widening common columns along the numeric lattice.

use crate::schema::{
    DataType, IncompatibleSchemaSnafu, PrimitiveType, SchemaError, StructField, StructType,
};

/// Whether `from` can be losslessly widened to `to`.
///
/// The widening lattice is `byte -> short -> integer -> long` and
/// `float -> double`. Equal types trivially widen.
pub fn can_widen(from: PrimitiveType, to: PrimitiveType) -> bool {
    use PrimitiveType::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Byte, Short | Integer | Long)
            | (Short, Integer | Long)
            | (Integer, Long)
            | (Float, Double)
    )
}

fn data_type_read_compatible(existing: &DataType, incoming: &DataType) -> bool {
    match (existing, incoming) {
        (DataType::Primitive(e), DataType::Primitive(i)) => can_widen(*e, *i),
        (DataType::Struct(e), DataType::Struct(i)) => is_read_compatible(e, i),
        (DataType::Array(e), DataType::Array(i)) => {
            // An array may not start admitting nulls under a reader that
            // assumed none.
            (!i.contains_null || e.contains_null)
                && data_type_read_compatible(&e.element_type, &i.element_type)
        }
        (DataType::Map(e), DataType::Map(i)) => {
            (!i.value_contains_null || e.value_contains_null)
                && data_type_read_compatible(&e.key_type, &i.key_type)
                && data_type_read_compatible(&e.value_type, &i.value_type)
        }
        _ => false,
    }
}

/// Whether a reader bound to `existing` can consume data written under
/// `incoming`.
pub fn is_read_compatible(existing: &StructType, incoming: &StructType) -> bool {
    // Every existing field must survive with a compatible type and without
    // gaining NOT NULL out from under the reader.
    for old in &existing.fields {
        match incoming.field(&old.name) {
            None => return false,
            Some(new) => {
                if old.nullable && !new.nullable {
                    return false;
                }
                if !data_type_read_compatible(&old.data_type, &new.data_type) {
                    return false;
                }
            }
        }
    }

    // New fields must be nullable so old rows remain representable.
    incoming
        .fields
        .iter()
        .filter(|f| existing.field(&f.name).is_none())
        .all(|f| f.nullable)
}

fn merge_data_types(
    column: &str,
    target: &DataType,
    source: &DataType,
) -> Result<DataType, SchemaError> {
    match (target, source) {
        (DataType::Primitive(t), DataType::Primitive(s)) => {
            if can_widen(*s, *t) {
                Ok(DataType::Primitive(*t))
            } else if can_widen(*t, *s) {
                Ok(DataType::Primitive(*s))
            } else {
                IncompatibleSchemaSnafu {
                    column,
                    existing: t.to_string(),
                    incoming: s.to_string(),
                }
                .fail()
            }
        }
        (DataType::Struct(t), DataType::Struct(s)) => {
            Ok(DataType::Struct(Box::new(merge_schemas(t, s)?)))
        }
        _ if target == source => Ok(target.clone()),
        _ => IncompatibleSchemaSnafu {
            column,
            existing: target.to_string(),
            incoming: source.to_string(),
        }
        .fail(),
    }
}

/// Produce the evolved schema of a MERGE with schema evolution enabled.
///
/// Target column order is preserved; new source columns are appended in
/// source order and forced nullable (pre-existing rows have no value for
/// them). Common columns take the wider numeric type; anything else that
/// differs is an incompatibility.
pub fn merge_schemas(target: &StructType, source: &StructType) -> Result<StructType, SchemaError> {
    let mut fields: Vec<StructField> = Vec::with_capacity(target.fields.len());

    for t in &target.fields {
        let merged = match source.field(&t.name) {
            Some(s) => StructField {
                name: t.name.clone(),
                data_type: merge_data_types(&t.name, &t.data_type, &s.data_type)?,
                nullable: t.nullable || s.nullable,
                metadata: t.metadata.clone(),
            },
            None => t.clone(),
        };
        fields.push(merged);
    }

    for s in &source.fields {
        if target.field(&s.name).is_none() {
            let mut appended = s.clone();
            appended.nullable = true;
            fields.push(appended);
        }
    }

    StructType::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructField;

    fn schema(fields: Vec<(&str, PrimitiveType, bool)>) -> StructType {
        StructType::new(
            fields
                .into_iter()
                .map(|(n, t, nullable)| StructField::new(n, DataType::primitive(t), nullable))
                .collect(),
        )
        .expect("valid schema")
    }

    #[test]
    fn widening_lattice() {
        use PrimitiveType::*;
        assert!(can_widen(Byte, Long));
        assert!(can_widen(Short, Integer));
        assert!(can_widen(Float, Double));
        assert!(can_widen(Integer, Integer));
        assert!(!can_widen(Long, Integer));
        assert!(!can_widen(Double, Float));
        assert!(!can_widen(Integer, Double));
        assert!(!can_widen(String, Long));
    }

    #[test]
    fn adding_nullable_field_is_read_compatible() {
        let old = schema(vec![("key", PrimitiveType::Integer, false)]);
        let new = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("extra", PrimitiveType::String, true),
        ]);
        assert!(is_read_compatible(&old, &new));
    }

    #[test]
    fn adding_non_nullable_field_is_not_read_compatible() {
        let old = schema(vec![("key", PrimitiveType::Integer, false)]);
        let new = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("extra", PrimitiveType::String, false),
        ]);
        assert!(!is_read_compatible(&old, &new));
    }

    #[test]
    fn removing_or_renaming_field_is_not_read_compatible() {
        let old = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("value", PrimitiveType::Long, true),
        ]);
        let removed = schema(vec![("key", PrimitiveType::Integer, false)]);
        let renamed = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("renamed", PrimitiveType::Long, true),
        ]);
        assert!(!is_read_compatible(&old, &removed));
        assert!(!is_read_compatible(&old, &renamed));
    }

    #[test]
    fn widening_is_read_compatible_narrowing_is_not() {
        let old = schema(vec![("v", PrimitiveType::Integer, true)]);
        let widened = schema(vec![("v", PrimitiveType::Long, true)]);
        let narrowed = schema(vec![("v", PrimitiveType::Short, true)]);
        assert!(is_read_compatible(&old, &widened));
        assert!(!is_read_compatible(&old, &narrowed));
    }

    #[test]
    fn nullable_field_may_not_become_required() {
        let old = schema(vec![("v", PrimitiveType::Long, true)]);
        let tightened = schema(vec![("v", PrimitiveType::Long, false)]);
        assert!(!is_read_compatible(&old, &tightened));
    }

    #[test]
    fn merge_appends_new_source_columns_as_nullable() {
        let target = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("value", PrimitiveType::Integer, true),
        ]);
        let source = schema(vec![
            ("key", PrimitiveType::Integer, false),
            ("value", PrimitiveType::Integer, true),
            ("extra", PrimitiveType::String, false),
        ]);

        let merged = merge_schemas(&target, &source).expect("merge");
        assert_eq!(
            merged.field_names().collect::<Vec<_>>(),
            vec!["key", "value", "extra"]
        );
        let extra = merged.field("extra").expect("extra present");
        assert!(extra.nullable, "appended column must be nullable");
    }

    #[test]
    fn merge_widens_common_columns() {
        let target = schema(vec![("v", PrimitiveType::Integer, true)]);
        let source = schema(vec![("v", PrimitiveType::Long, true)]);

        let merged = merge_schemas(&target, &source).expect("merge");
        assert_eq!(
            merged.field("v").map(|f| &f.data_type),
            Some(&DataType::primitive(PrimitiveType::Long))
        );
    }

    #[test]
    fn merge_rejects_conflicting_types() {
        let target = schema(vec![("v", PrimitiveType::Integer, true)]);
        let source = schema(vec![("v", PrimitiveType::String, true)]);

        let result = merge_schemas(&target, &source);
        assert!(matches!(result, Err(SchemaError::IncompatibleSchema { .. })));
    }
}
