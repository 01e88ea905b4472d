//! Named operations recorded in commit provenance.
//!
//! Operation names are preserved verbatim in `CommitInfo.operation`; tools
//! that read table history match on these strings, so they are part of the
//! on-disk contract. Operations the library executes get structured
//! variants; the remainder of the recognized vocabulary is still carried so
//! histories written elsewhere describe themselves.

use std::collections::HashMap;

use serde_json::Value;

use crate::expr::Expr;
use crate::transaction_log::actions::Protocol;

/// Every operation name recognized in `CommitInfo.operation`.
pub const OPERATION_NAMES: &[&str] = &[
    "WRITE",
    "STREAMING UPDATE",
    "DELETE",
    "TRUNCATE",
    "MERGE",
    "UPDATE",
    "CREATE TABLE",
    "CREATE TABLE AS SELECT",
    "REPLACE TABLE",
    "REPLACE TABLE AS SELECT",
    "SET TBLPROPERTIES",
    "UNSET TBLPROPERTIES",
    "ADD COLUMNS",
    "CHANGE COLUMN",
    "REPLACE COLUMNS",
    "UPGRADE PROTOCOL",
    "CONVERT",
    "OPTIMIZE",
    "Manual Update",
    "FILE NOTIFICATION RETENTION",
    "COMPUTE STATS",
    "RESET ZCUBE INFO",
    "UPDATE SCHEMA",
    "FSCK",
];

/// Deprecated MERGE parameter keys, written as `null` for compatibility.
const DEPRECATED_MERGE_KEYS: &[&str] = &["updatePredicate", "deletePredicate", "insertPredicate"];

/// The operation a commit performs, for provenance.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOperation {
    /// Batch write / append.
    Write {
        /// Save mode recorded in the parameters (`Append`, `Overwrite`).
        mode: String,
        /// Partition columns, when (re)declared by the write.
        partition_by: Option<Vec<String>>,
    },

    /// Micro-batch write from a streaming query.
    StreamingUpdate {
        /// Output mode of the streaming sink.
        output_mode: String,
        /// Stable query identifier.
        query_id: String,
        /// Epoch within the query.
        epoch_id: i64,
    },

    /// Row or file level deletion.
    Delete {
        /// The deletion predicate, when one was supplied.
        predicate: Option<Expr>,
    },

    /// Removal of every file without a predicate.
    Truncate,

    /// Two-phase upsert.
    Merge {
        /// The join condition.
        predicate: Expr,
    },

    /// Row rewrite with SET assignments.
    Update {
        /// The update predicate, when one was supplied.
        predicate: Option<Expr>,
    },

    /// Table creation.
    CreateTable {
        /// Whether data was written in the same commit (CTAS).
        as_select: bool,
    },

    /// Table replacement.
    ReplaceTable {
        /// Whether data was written in the same commit.
        as_select: bool,
    },

    /// Property assignment.
    SetTblProperties {
        /// The properties set.
        properties: HashMap<String, String>,
    },

    /// Property removal.
    UnsetTblProperties {
        /// The keys removed.
        keys: Vec<String>,
    },

    /// Schema extension with new columns.
    AddColumns,

    /// Single-column alteration.
    ChangeColumn,

    /// Full column-list replacement.
    ReplaceColumns,

    /// Explicit protocol upgrade.
    UpgradeProtocol {
        /// The protocol committed.
        new_protocol: Protocol,
    },

    /// Conversion of a raw columnar directory.
    Convert,

    /// File compaction / clustering.
    Optimize {
        /// Z-order columns, treated as an opaque operation input.
        zorder_by: Vec<String>,
    },

    /// Out-of-band log repair.
    ManualUpdate,

    /// Retention sweep driven by file notifications.
    FileNotificationRetention,

    /// Statistics recomputation.
    ComputeStats,

    /// Clustering metadata reset.
    ResetZCubeInfo,

    /// Standalone schema update.
    UpdateSchema,

    /// Log/file consistency repair.
    Fsck,
}

impl DeltaOperation {
    /// The verbatim operation name.
    pub fn name(&self) -> &'static str {
        match self {
            DeltaOperation::Write { .. } => "WRITE",
            DeltaOperation::StreamingUpdate { .. } => "STREAMING UPDATE",
            DeltaOperation::Delete { .. } => "DELETE",
            DeltaOperation::Truncate => "TRUNCATE",
            DeltaOperation::Merge { .. } => "MERGE",
            DeltaOperation::Update { .. } => "UPDATE",
            DeltaOperation::CreateTable { as_select: false } => "CREATE TABLE",
            DeltaOperation::CreateTable { as_select: true } => "CREATE TABLE AS SELECT",
            DeltaOperation::ReplaceTable { as_select: false } => "REPLACE TABLE",
            DeltaOperation::ReplaceTable { as_select: true } => "REPLACE TABLE AS SELECT",
            DeltaOperation::SetTblProperties { .. } => "SET TBLPROPERTIES",
            DeltaOperation::UnsetTblProperties { .. } => "UNSET TBLPROPERTIES",
            DeltaOperation::AddColumns => "ADD COLUMNS",
            DeltaOperation::ChangeColumn => "CHANGE COLUMN",
            DeltaOperation::ReplaceColumns => "REPLACE COLUMNS",
            DeltaOperation::UpgradeProtocol { .. } => "UPGRADE PROTOCOL",
            DeltaOperation::Convert => "CONVERT",
            DeltaOperation::Optimize { .. } => "OPTIMIZE",
            DeltaOperation::ManualUpdate => "Manual Update",
            DeltaOperation::FileNotificationRetention => "FILE NOTIFICATION RETENTION",
            DeltaOperation::ComputeStats => "COMPUTE STATS",
            DeltaOperation::ResetZCubeInfo => "RESET ZCUBE INFO",
            DeltaOperation::UpdateSchema => "UPDATE SCHEMA",
            DeltaOperation::Fsck => "FSCK",
        }
    }

    /// Parameters recorded under `operationParameters`.
    ///
    /// Values are JSON strings (rendered predicates, serialized lists);
    /// deprecated keys are present with `null` values.
    pub fn parameters(&self) -> HashMap<String, Value> {
        let mut params = HashMap::new();
        match self {
            DeltaOperation::Write { mode, partition_by } => {
                params.insert("mode".to_string(), Value::String(mode.clone()));
                if let Some(columns) = partition_by {
                    params.insert(
                        "partitionBy".to_string(),
                        Value::String(serde_json::to_string(columns).unwrap_or_default()),
                    );
                }
            }
            DeltaOperation::StreamingUpdate {
                output_mode,
                query_id,
                epoch_id,
            } => {
                params.insert(
                    "outputMode".to_string(),
                    Value::String(output_mode.clone()),
                );
                params.insert("queryId".to_string(), Value::String(query_id.clone()));
                params.insert(
                    "epochId".to_string(),
                    Value::String(epoch_id.to_string()),
                );
            }
            DeltaOperation::Delete { predicate } | DeltaOperation::Update { predicate } => {
                params.insert(
                    "predicate".to_string(),
                    match predicate {
                        Some(p) => Value::String(p.to_string()),
                        None => Value::Null,
                    },
                );
            }
            DeltaOperation::Merge { predicate } => {
                params.insert(
                    "predicate".to_string(),
                    Value::String(predicate.to_string()),
                );
                for key in DEPRECATED_MERGE_KEYS {
                    params.insert((*key).to_string(), Value::Null);
                }
            }
            DeltaOperation::CreateTable { .. } | DeltaOperation::ReplaceTable { .. } => {
                params.insert(
                    "isManaged".to_string(),
                    Value::String("false".to_string()),
                );
            }
            DeltaOperation::SetTblProperties { properties } => {
                params.insert(
                    "properties".to_string(),
                    Value::String(serde_json::to_string(properties).unwrap_or_default()),
                );
            }
            DeltaOperation::UnsetTblProperties { keys } => {
                params.insert(
                    "properties".to_string(),
                    Value::String(serde_json::to_string(keys).unwrap_or_default()),
                );
            }
            DeltaOperation::UpgradeProtocol { new_protocol } => {
                params.insert(
                    "newProtocolVersion".to_string(),
                    Value::String(format!(
                        "({}, {})",
                        new_protocol.min_reader_version, new_protocol.min_writer_version
                    )),
                );
            }
            DeltaOperation::Optimize { zorder_by } => {
                params.insert(
                    "zOrderBy".to_string(),
                    Value::String(serde_json::to_string(zorder_by).unwrap_or_default()),
                );
            }
            _ => {}
        }
        params
    }

    /// Whether the operation may replace the table schema wholesale (so the
    /// read-compatibility check does not apply).
    pub fn replaces_schema(&self) -> bool {
        matches!(
            self,
            DeltaOperation::CreateTable { .. }
                | DeltaOperation::ReplaceTable { .. }
                | DeltaOperation::ReplaceColumns
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn names_are_verbatim_and_recognized() {
        let operations = [
            DeltaOperation::Write {
                mode: "Append".to_string(),
                partition_by: None,
            },
            DeltaOperation::Merge {
                predicate: Expr::col("s.k").eq(Expr::col("t.k")),
            },
            DeltaOperation::CreateTable { as_select: true },
            DeltaOperation::ManualUpdate,
            DeltaOperation::ResetZCubeInfo,
            DeltaOperation::Fsck,
        ];
        for op in operations {
            assert!(
                OPERATION_NAMES.contains(&op.name()),
                "{} missing from the vocabulary",
                op.name()
            );
        }
        assert_eq!(
            DeltaOperation::CreateTable { as_select: true }.name(),
            "CREATE TABLE AS SELECT"
        );
    }

    #[test]
    fn merge_parameters_null_out_deprecated_keys() {
        let op = DeltaOperation::Merge {
            predicate: Expr::col("s.k").eq(Expr::col("t.k")),
        };
        let params = op.parameters();
        assert_eq!(params["predicate"], Value::String("(s.k = t.k)".to_string()));
        for key in DEPRECATED_MERGE_KEYS {
            assert_eq!(params[*key], Value::Null, "{key} must be null");
        }
    }

    #[test]
    fn delete_without_predicate_records_null() {
        let params = DeltaOperation::Delete { predicate: None }.parameters();
        assert_eq!(params["predicate"], Value::Null);
    }
}
