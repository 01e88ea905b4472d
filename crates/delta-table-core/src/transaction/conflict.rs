//! Conflict detection between a pending transaction and winning commits.
//!
//! When a commit loses the race for a version, every commit that landed in
//! between is replayed against the loser's read-set and pending actions.
//! Either the winner is provably disjoint — then the loser rebases and
//! retries — or the transaction aborts with a classified conflict carrying
//! the winner's provenance so callers can see who beat them.

use std::collections::HashSet;

use snafu::prelude::*;

use crate::expr::Expr;
use crate::index::FileIndex;
use crate::schema::StructType;
use crate::transaction_log::actions::{Action, CommitInfo};

/// A classified commit conflict.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConflictError {
    /// The winner added files the losing transaction's reads would have
    /// seen.
    #[snafu(display("Concurrent append conflicts with this transaction's reads: {path}"))]
    ConcurrentAppend {
        /// A conflicting file added by the winner.
        path: String,
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },

    /// The winner removed a file the losing transaction read.
    #[snafu(display("Concurrently deleted file was read by this transaction: {path}"))]
    ConcurrentDeleteRead {
        /// The removed file.
        path: String,
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },

    /// Both commits removed the same file.
    #[snafu(display("File was deleted by this and a concurrent transaction: {path}"))]
    ConcurrentDeleteDelete {
        /// The doubly-removed file.
        path: String,
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },

    /// Both commits advanced the same application watermark.
    #[snafu(display("Concurrent transaction for application {app_id}"))]
    ConcurrentTransaction {
        /// The contested application id.
        app_id: String,
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },

    /// The winner changed table metadata.
    #[snafu(display("Table metadata changed by a concurrent commit"))]
    MetadataChanged {
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },

    /// The winner changed the protocol.
    #[snafu(display("Table protocol changed by a concurrent commit"))]
    ProtocolChanged {
        /// Provenance of the winning commit.
        winning_commit: Option<CommitInfo>,
    },
}

/// The loser's side of the comparison.
#[derive(Debug)]
pub(crate) struct TransactionFootprint<'a> {
    /// Predicates the transaction scanned with.
    pub read_predicates: &'a [Expr],
    /// Paths of files the transaction read.
    pub read_files: &'a HashSet<String>,
    /// Whether the transaction read the table without narrowing.
    pub read_whole_table: bool,
    /// Paths the transaction removes.
    pub removed_paths: HashSet<String>,
    /// Application ids the transaction advances.
    pub txn_app_ids: HashSet<String>,
    /// Whether the transaction is a pure blind append.
    pub is_blind_append: bool,
    /// Target schema, for testing winning adds against read predicates.
    pub schema: &'a StructType,
    /// Partition columns of the target.
    pub partition_columns: &'a [String],
}

impl TransactionFootprint<'_> {
    /// Check one winning commit's actions against this footprint.
    pub(crate) fn check(&self, winning: &[Action]) -> Result<(), ConflictError> {
        let winning_commit = winning.iter().find_map(|a| match a {
            Action::CommitInfo(ci) => Some(ci.clone()),
            _ => None,
        });

        for action in winning {
            match action {
                Action::Metadata(_) => {
                    return MetadataChangedSnafu { winning_commit }.fail();
                }
                Action::Protocol(_) => {
                    return ProtocolChangedSnafu { winning_commit }.fail();
                }
                Action::Txn(t) => {
                    ensure!(
                        !self.txn_app_ids.contains(&t.app_id),
                        ConcurrentTransactionSnafu {
                            app_id: t.app_id.clone(),
                            winning_commit: winning_commit.clone(),
                        }
                    );
                }
                Action::Remove(r) => {
                    ensure!(
                        !self.removed_paths.contains(&r.path),
                        ConcurrentDeleteDeleteSnafu {
                            path: r.path.clone(),
                            winning_commit: winning_commit.clone(),
                        }
                    );
                    ensure!(
                        !self.read_whole_table && !self.read_files.contains(&r.path),
                        ConcurrentDeleteReadSnafu {
                            path: r.path.clone(),
                            winning_commit: winning_commit.clone(),
                        }
                    );
                }
                Action::Add(_) | Action::CommitInfo(_) => {}
            }
        }

        // A blind append never observed table state, so someone else's
        // appended files cannot invalidate it.
        if self.is_blind_append {
            return Ok(());
        }

        let winning_adds: Vec<_> = winning
            .iter()
            .filter_map(|a| match a {
                Action::Add(add) => Some(add),
                _ => None,
            })
            .collect();
        if winning_adds.is_empty() {
            return Ok(());
        }

        if self.read_whole_table {
            return ConcurrentAppendSnafu {
                path: winning_adds[0].path.clone(),
                winning_commit,
            }
            .fail();
        }

        // An added file conflicts when it could have matched the reads.
        // Data skipping is conservative, which is the right direction here:
        // anything unprovably disjoint aborts.
        let index = FileIndex::new(self.schema, self.partition_columns, true);
        let overlapping = index.filter(winning_adds.into_iter(), self.read_predicates);
        if let Some(add) = overlapping.first() {
            return ConcurrentAppendSnafu {
                path: add.path.clone(),
                winning_commit,
            }
            .fail();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, PrimitiveType, StructField};
    use crate::transaction_log::actions::{AddFile, Metadata, Protocol, RemoveFile, Txn};

    fn schema() -> StructType {
        StructType::new(vec![StructField::new(
            "k",
            DataType::primitive(PrimitiveType::Integer),
            false,
        )])
        .expect("valid schema")
    }

    fn footprint<'a>(
        schema: &'a StructType,
        read_predicates: &'a [Expr],
        read_files: &'a HashSet<String>,
    ) -> TransactionFootprint<'a> {
        TransactionFootprint {
            read_predicates,
            read_files,
            read_whole_table: false,
            removed_paths: HashSet::new(),
            txn_app_ids: HashSet::new(),
            is_blind_append: false,
            schema,
            partition_columns: &[],
        }
    }

    fn add_with_key_range(path: &str, min: i64, max: i64) -> AddFile {
        AddFile::new(path, 10).with_stats(format!(
            r#"{{"numRecords":1,"minValues":{{"k":{min}}},"maxValues":{{"k":{max}}},"nullCount":{{"k":0}}}}"#
        ))
    }

    #[test]
    fn metadata_change_always_conflicts() {
        let schema = schema();
        let reads = HashSet::new();
        let fp = footprint(&schema, &[], &reads);

        let winning = vec![Action::Metadata(Metadata {
            id: "x".to_string(),
            name: None,
            description: None,
            format: Default::default(),
            schema_string: String::new(),
            partition_columns: vec![],
            configuration: Default::default(),
            created_time: None,
        })];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::MetadataChanged { .. })
        ));
    }

    #[test]
    fn protocol_change_always_conflicts() {
        let schema = schema();
        let reads = HashSet::new();
        let fp = footprint(&schema, &[], &reads);

        let winning = vec![Action::Protocol(Protocol {
            min_reader_version: 1,
            min_writer_version: 3,
        })];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ProtocolChanged { .. })
        ));
    }

    #[test]
    fn blind_appends_are_compatible() {
        let schema = schema();
        let reads = HashSet::new();
        let mut fp = footprint(&schema, &[], &reads);
        fp.is_blind_append = true;

        let winning = vec![Action::Add(add_with_key_range("w.json", 0, 100))];
        fp.check(&winning).expect("append vs blind append is fine");
    }

    #[test]
    fn append_matching_read_predicates_conflicts() {
        let schema = schema();
        let reads = HashSet::new();
        let predicates = vec![Expr::col("k").eq(Expr::lit(1))];
        let fp = footprint(&schema, &predicates, &reads);

        // Winner's file covers k=1: overlap.
        let winning = vec![Action::Add(add_with_key_range("w.json", 0, 5))];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ConcurrentAppend { .. })
        ));

        // Winner's file is provably disjoint from the reads: rebase is fine.
        let winning = vec![Action::Add(add_with_key_range("w.json", 50, 99))];
        fp.check(&winning).expect("disjoint append is compatible");
    }

    #[test]
    fn remove_of_read_file_conflicts() {
        let schema = schema();
        let reads: HashSet<String> = [String::from("shared.json")].into();
        let fp = footprint(&schema, &[], &reads);

        let winning = vec![Action::Remove(RemoveFile::new("shared.json"))];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ConcurrentDeleteRead { .. })
        ));
    }

    #[test]
    fn double_delete_conflicts() {
        let schema = schema();
        let reads = HashSet::new();
        let mut fp = footprint(&schema, &[], &reads);
        fp.removed_paths.insert("gone.json".to_string());

        let winning = vec![Action::Remove(RemoveFile::new("gone.json"))];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ConcurrentDeleteDelete { .. })
        ));
    }

    #[test]
    fn same_app_id_watermark_conflicts() {
        let schema = schema();
        let reads = HashSet::new();
        let mut fp = footprint(&schema, &[], &reads);
        fp.txn_app_ids.insert("stream-1".to_string());

        let winning = vec![Action::Txn(Txn {
            app_id: "stream-1".to_string(),
            version: 9,
            last_updated: None,
        })];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ConcurrentTransaction { .. })
        ));
    }

    #[test]
    fn whole_table_read_conflicts_with_any_append() {
        let schema = schema();
        let reads = HashSet::new();
        let mut fp = footprint(&schema, &[], &reads);
        fp.read_whole_table = true;

        let winning = vec![Action::Add(add_with_key_range("w.json", 0, 1))];
        assert!(matches!(
            fp.check(&winning),
            Err(ConflictError::ConcurrentAppend { .. })
        ));
    }
}
