//! Log actions and the line codec.
//!
//! Each commit file stores one JSON object per line, and each object has a
//! single top-level field naming the action variant (`add`, `remove`,
//! `metaData`, `protocol`, `txn`, `commitInfo`). The codec here inspects
//! that discriminator explicitly so that unknown discriminators are skipped
//! rather than rejected, which is what keeps old readers working against
//! logs written by newer writers. Unknown fields inside a known variant are
//! ignored for the same reason.
//!
//! `AddFile.stats` is carried as an opaque JSON string; only the file index
//! parses it, lazily.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, prelude::*};

fn default_true() -> bool {
    true
}

/// Adds a data file to the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Relative path of the data file under the table root.
    pub path: String,

    /// Partition column values for this file. A JSON `null` value encodes a
    /// SQL NULL partition value.
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,

    /// File size in bytes.
    pub size: i64,

    /// When the file was written, in milliseconds since the epoch.
    #[serde(default)]
    pub modification_time: i64,

    /// Whether this action represents a user-visible data change, as opposed
    /// to a reorganization such as compaction output.
    #[serde(default = "default_true")]
    pub data_change: bool,

    /// Per-file statistics as an opaque JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,

    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

impl AddFile {
    /// A new data-changing `AddFile` stamped with the current time.
    pub fn new(path: impl Into<String>, size: i64) -> Self {
        Self {
            path: path.into(),
            partition_values: HashMap::new(),
            size,
            modification_time: Utc::now().timestamp_millis(),
            data_change: true,
            stats: None,
            tags: None,
        }
    }

    /// Sets a partition value; `None` encodes SQL NULL.
    pub fn with_partition_value(
        mut self,
        column: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        self.partition_values.insert(column.into(), value);
        self
    }

    /// Attaches a stats JSON document.
    pub fn with_stats(mut self, stats: impl Into<String>) -> Self {
        self.stats = Some(stats.into());
        self
    }
}

/// Tombstones a previously-added file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Relative path of the file being removed.
    pub path: String,

    /// When the file was logically deleted, in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,

    /// Whether the removal is a user-visible data change.
    #[serde(default = "default_true")]
    pub data_change: bool,
}

impl RemoveFile {
    /// A new data-changing tombstone stamped with the current time.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            deletion_timestamp: Some(Utc::now().timestamp_millis()),
            data_change: true,
        }
    }
}

/// Data file format descriptor inside [`Metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    /// Format name, e.g. `parquet`.
    pub provider: String,

    /// Format-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Table-level metadata; at most one instance is effective, last wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Stable table identifier.
    pub id: String,

    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Data file format.
    #[serde(default)]
    pub format: Format,

    /// Table schema serialized as a JSON document (see the schema module).
    pub schema_string: String,

    /// Columns the table is partitioned by, in partitioning order.
    #[serde(default)]
    pub partition_columns: Vec<String>,

    /// Table properties.
    #[serde(default)]
    pub configuration: HashMap<String, String>,

    /// When the table was created, in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

/// Minimum reader/writer versions required to access the table; last wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Minimum protocol version a reader must implement.
    pub min_reader_version: i32,

    /// Minimum protocol version a writer must implement.
    pub min_writer_version: i32,
}

/// Application transaction watermark for exactly-once streaming sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Txn {
    /// Application identifier; watermarks are keyed by this.
    pub app_id: String,

    /// Application-defined version.
    pub version: i64,

    /// When the watermark was last advanced, in milliseconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

/// Commit provenance. Replay ignores it; `history()` reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Commit wall-clock timestamp in milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,

    /// Operation name, e.g. `MERGE` (see [`crate::transaction::OPERATION_NAMES`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Operation parameters. Values are preserved verbatim; writers emit
    /// JSON strings (or `null` for deprecated keys).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operation_parameters: HashMap<String, Value>,

    /// The snapshot version the transaction was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,

    /// Isolation level the commit was validated under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<String>,

    /// Whether the commit only appended files without reading table state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_blind_append: Option<bool>,

    /// Operation metrics such as rows updated or files removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_metrics: Option<HashMap<String, String>>,

    /// Free-form user-supplied metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<String>,
}

/// An action recorded in a commit, applied in order during replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Makes a file logically part of the table.
    #[serde(rename = "add")]
    Add(AddFile),

    /// Tombstones a previously-added file.
    #[serde(rename = "remove")]
    Remove(RemoveFile),

    /// Replaces the effective table metadata.
    #[serde(rename = "metaData")]
    Metadata(Metadata),

    /// Replaces the effective protocol versions.
    #[serde(rename = "protocol")]
    Protocol(Protocol),

    /// Advances an application transaction watermark.
    #[serde(rename = "txn")]
    Txn(Txn),

    /// Commit provenance.
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
}

/// Known top-level discriminators, in the order they are probed.
const DISCRIMINATORS: [&str; 6] = ["add", "remove", "metaData", "protocol", "txn", "commitInfo"];

/// Errors raised by the line codec.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// A log line was not a JSON object.
    #[snafu(display("Log line is not a JSON object: {line}"))]
    NotAnObject {
        /// The offending line, truncated for display.
        line: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A log line failed to parse as JSON, or a known variant's payload did
    /// not match its schema.
    #[snafu(display("Malformed log line: {source}"))]
    Malformed {
        /// The underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

fn truncate_for_display(line: &str) -> String {
    const MAX: usize = 120;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let head: String = line.chars().take(MAX).collect();
        format!("{head}…")
    }
}

impl Action {
    /// Serializes the action as a single compact JSON line.
    pub fn to_line(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).context(MalformedSnafu)
    }

    /// Parses one log line.
    ///
    /// Returns `Ok(None)` when the object carries no known discriminator
    /// (forward compatibility); fails only on non-JSON input or a known
    /// variant whose payload does not deserialize.
    pub fn parse_line(line: &str) -> Result<Option<Action>, CodecError> {
        let value: Value = serde_json::from_str(line).context(MalformedSnafu)?;
        let object = match value {
            Value::Object(map) => map,
            _ => {
                return NotAnObjectSnafu {
                    line: truncate_for_display(line),
                }
                .fail();
            }
        };

        for key in DISCRIMINATORS {
            if let Some(payload) = object.get(key) {
                let payload = payload.clone();
                let action = match key {
                    "add" => Action::Add(serde_json::from_value(payload).context(MalformedSnafu)?),
                    "remove" => {
                        Action::Remove(serde_json::from_value(payload).context(MalformedSnafu)?)
                    }
                    "metaData" => {
                        Action::Metadata(serde_json::from_value(payload).context(MalformedSnafu)?)
                    }
                    "protocol" => {
                        Action::Protocol(serde_json::from_value(payload).context(MalformedSnafu)?)
                    }
                    "txn" => Action::Txn(serde_json::from_value(payload).context(MalformedSnafu)?),
                    "commitInfo" => {
                        Action::CommitInfo(serde_json::from_value(payload).context(MalformedSnafu)?)
                    }
                    _ => unreachable!("probed key is always a known discriminator"),
                };
                return Ok(Some(action));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_file_line_roundtrip() {
        let add = AddFile::new("data/part-00000.parquet", 1024)
            .with_partition_value("date", Some("2024-01-01".to_string()))
            .with_stats(r#"{"numRecords":100}"#);
        let action = Action::Add(add.clone());

        let line = action.to_line().expect("serialize");
        assert!(line.starts_with(r#"{"add":"#));

        let back = Action::parse_line(&line).expect("parse").expect("known");
        assert_eq!(back, action);
    }

    #[test]
    fn protocol_line_matches_wire_format() {
        let action = Action::Protocol(Protocol {
            min_reader_version: 1,
            min_writer_version: 3,
        });

        let line = action.to_line().expect("serialize");
        assert_eq!(line, r#"{"protocol":{"minReaderVersion":1,"minWriterVersion":3}}"#);
    }

    #[test]
    fn remove_file_defaults_data_change_true() {
        let line = r#"{"remove":{"path":"a.parquet","deletionTimestamp":1600000000000}}"#;
        let action = Action::parse_line(line).expect("parse").expect("known");

        match action {
            Action::Remove(r) => {
                assert_eq!(r.path, "a.parquet");
                assert!(r.data_change);
            }
            other => panic!("expected Remove, got {other:?}"),
        }
    }

    #[test]
    fn null_partition_value_roundtrip() {
        let add = AddFile::new("p.parquet", 1).with_partition_value("k", None);
        let line = Action::Add(add).to_line().expect("serialize");
        assert!(line.contains(r#""k":null"#));

        let back = Action::parse_line(&line).expect("parse").expect("known");
        match back {
            Action::Add(a) => assert_eq!(a.partition_values.get("k"), Some(&None)),
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminator_is_ignored() {
        let parsed = Action::parse_line(r#"{"cdc":{"path":"x"}}"#).expect("parse");
        assert!(parsed.is_none());
    }

    #[test]
    fn unknown_fields_inside_known_variant_are_ignored() {
        let line = r#"{"txn":{"appId":"app-1","version":7,"futureField":true}}"#;
        let action = Action::parse_line(line).expect("parse").expect("known");
        match action {
            Action::Txn(t) => {
                assert_eq!(t.app_id, "app-1");
                assert_eq!(t.version, 7);
                assert_eq!(t.last_updated, None);
            }
            other => panic!("expected Txn, got {other:?}"),
        }
    }

    #[test]
    fn non_object_line_is_an_error() {
        assert!(matches!(
            Action::parse_line(r#"["add"]"#),
            Err(CodecError::NotAnObject { .. })
        ));
        assert!(matches!(
            Action::parse_line("not json"),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn metadata_roundtrip_preserves_configuration() {
        let meta = Metadata {
            id: "3f1c7a2e".to_string(),
            name: Some("events".to_string()),
            description: None,
            format: Format::default(),
            schema_string: r#"{"type":"struct","fields":[]}"#.to_string(),
            partition_columns: vec!["date".to_string()],
            configuration: [("delta.appendOnly".to_string(), "true".to_string())]
                .into_iter()
                .collect(),
            created_time: Some(1_600_000_000_000),
        };
        let line = Action::Metadata(meta.clone()).to_line().expect("serialize");
        let back = Action::parse_line(&line).expect("parse").expect("known");
        assert_eq!(back, Action::Metadata(meta));
    }

    #[test]
    fn commit_info_tolerates_arbitrary_parameter_values() {
        let line = r#"{"commitInfo":{"timestamp":1600000000000,"operation":"MERGE",
            "operationParameters":{"predicate":"(k = 1)","updatePredicate":null,
            "matchedPredicates":[{"actionType":"update"}]}}}"#
            .replace('\n', "");
        let action = Action::parse_line(&line).expect("parse").expect("known");
        match action {
            Action::CommitInfo(ci) => {
                assert_eq!(ci.operation.as_deref(), Some("MERGE"));
                assert_eq!(
                    ci.operation_parameters.get("updatePredicate"),
                    Some(&Value::Null)
                );
            }
            other => panic!("expected CommitInfo, got {other:?}"),
        }
    }
}
