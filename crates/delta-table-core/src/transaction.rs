//! Optimistic transactions.
//!
//! A transaction captures the snapshot it read, tracks which files and
//! predicates its reads touched, and commits by attempting to create the
//! next log version. The log store's create-only write is the sole
//! serialization point: losing it means another writer owns that version,
//! so the loser replays the winner's actions against its own footprint and
//! either rebases and retries (bounded) or aborts with a classified
//! conflict.
//!
//! Aborting before the commit write has no side effects — dropping the
//! transaction is an abort. After the write succeeds the commit is final;
//! post-commit work (checkpointing) is advisory.

pub mod conflict;
pub mod operation;

pub use conflict::ConflictError;
pub use operation::{DeltaOperation, OPERATION_NAMES};

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::Utc;
use log::warn;
use snafu::prelude::*;

use crate::config::{ConfigError, TableConfig};
use crate::expr::Expr;
use crate::index::FileIndex;
use crate::schema::{compat, SchemaError, StructType};
use crate::storage::StorageError;
use crate::transaction::conflict::TransactionFootprint;
use crate::transaction_log::actions::{Action, AddFile, CommitInfo};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::{protocol, CommitError, Snapshot};

/// Bounded number of commit attempts before giving up.
pub const MAX_COMMIT_ATTEMPTS: usize = 10;

/// Isolation level a commit is validated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Full serializability; reads are part of the conflict footprint.
    Serializable,
    /// Pure blind appends; only write-write conflicts matter.
    SnapshotIsolation,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Serializable => write!(f, "Serializable"),
            IsolationLevel::SnapshotIsolation => write!(f, "SnapshotIsolation"),
        }
    }
}

/// Errors raised while preparing or committing a transaction.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransactionError {
    /// Log store failure.
    #[snafu(display("Transaction log error: {source}"))]
    Log {
        /// Underlying commit-log error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// The commit conflicts with a concurrent winner.
    #[snafu(display("Commit conflict: {source}"))]
    Conflict {
        /// The classified conflict.
        #[snafu(source)]
        source: ConflictError,
    },

    /// Conflict resolution kept losing races.
    #[snafu(display("Commit failed after {attempts} attempts"))]
    MaxRetryExceeded {
        /// How many attempts were made.
        attempts: usize,
    },

    /// Protocol gate rejection.
    #[snafu(display("Protocol error: {source}"))]
    TxnProtocol {
        /// Underlying protocol error.
        #[snafu(source)]
        source: protocol::ProtocolError,
    },

    /// Schema parse or validation failure.
    #[snafu(display("Schema error: {source}"))]
    TxnSchema {
        /// Underlying schema error.
        #[snafu(source)]
        source: SchemaError,
    },

    /// New metadata's properties failed the strict check.
    #[snafu(display("Table property error: {source}"))]
    TxnConfig {
        /// Underlying config error.
        #[snafu(source)]
        source: ConfigError,
    },

    /// A metadata commit would break existing readers.
    #[snafu(display("Incompatible schema change: {msg}"))]
    IncompatibleSchemaChange {
        /// What was incompatible.
        msg: String,
    },

    /// The action list is malformed.
    #[snafu(display("Invalid commit actions: {msg}"))]
    InvalidActions {
        /// What was wrong.
        msg: String,
    },

    /// A data-changing remove was committed to an append-only table.
    #[snafu(display("Cannot remove files from an append-only table: {path}"))]
    AppendOnlyTable {
        /// The file the commit tried to remove.
        path: String,
    },

    /// An added path is already live in the table.
    #[snafu(display("File path is already present in the table: {path}"))]
    DuplicateFilePath {
        /// The duplicated path.
        path: String,
    },
}

/// A read-tracked optimistic transaction against one table.
#[derive(Debug)]
pub struct OptimisticTransaction {
    store: LogStore,
    snapshot: Snapshot,
    read_predicates: Vec<Expr>,
    read_files: HashSet<String>,
    read_whole_table: bool,
}

impl OptimisticTransaction {
    /// Start a transaction from the given snapshot.
    pub fn new(store: LogStore, snapshot: Snapshot) -> Self {
        Self {
            store,
            snapshot,
            read_predicates: Vec::new(),
            read_files: HashSet::new(),
            read_whole_table: false,
        }
    }

    /// The version this transaction is based on.
    pub fn read_version(&self) -> Version {
        self.snapshot.version
    }

    /// The snapshot this transaction reads from.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Narrow the snapshot's files with data skipping, recording the
    /// predicates and surviving files in the transaction's read-set.
    pub fn filter_files(&mut self, predicates: &[Expr]) -> Result<Vec<AddFile>, TransactionError> {
        let schema = self.snapshot.schema().context(TxnSchemaSnafu)?;
        let config = self.snapshot.config();
        let index = FileIndex::new(
            &schema,
            self.snapshot.partition_columns(),
            config.stats_skipping,
        );

        let files = index.filter(self.snapshot.files.values(), predicates);
        self.read_predicates.extend_from_slice(predicates);
        self.read_files.extend(files.iter().map(|f| f.path.clone()));
        Ok(files)
    }

    /// Record that the whole table was read, without narrowing.
    pub fn read_whole_table(&mut self) -> Vec<AddFile> {
        self.read_whole_table = true;
        let files: Vec<AddFile> = self.snapshot.files.values().cloned().collect();
        self.read_files.extend(files.iter().map(|f| f.path.clone()));
        files
    }

    /// Abort without side effects. Dropping the transaction is equivalent.
    pub fn abort(self) {}

    /// Commit `actions` as the next table version.
    pub async fn commit(
        self,
        actions: Vec<Action>,
        operation: DeltaOperation,
    ) -> Result<Version, TransactionError> {
        self.commit_with_metrics(actions, operation, HashMap::new())
            .await
    }

    /// Commit with operation metrics attached to the provenance record.
    pub async fn commit_with_metrics(
        mut self,
        actions: Vec<Action>,
        operation: DeltaOperation,
        metrics: HashMap<String, String>,
    ) -> Result<Version, TransactionError> {
        let (actions, mut commit_info, isolation) =
            self.validate_and_prepare(actions, &operation, metrics)?;

        // The footprint's schema comes from the base snapshot; a concurrent
        // metadata change aborts before any rebase could make it stale.
        let schema = self.snapshot.schema().context(TxnSchemaSnafu)?;
        let partition_columns = self.snapshot.partition_columns().to_vec();

        let removed_paths: HashSet<String> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Remove(r) => Some(r.path.clone()),
                _ => None,
            })
            .collect();
        let txn_app_ids: HashSet<String> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Txn(t) => Some(t.app_id.clone()),
                _ => None,
            })
            .collect();

        let checkpoint_interval = self.snapshot.config().checkpoint_interval;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let target = self.snapshot.version + 1;
            commit_info.read_version = Some(self.snapshot.version);

            let mut lines = Vec::with_capacity(actions.len() + 1);
            lines.push(encode(target, &Action::CommitInfo(commit_info.clone()))?);
            for action in &actions {
                lines.push(encode(target, action)?);
            }

            match self.store.write_commit(target, lines).await {
                Ok(()) => {
                    maybe_checkpoint(&self.store, target, checkpoint_interval).await;
                    return Ok(target);
                }
                Err(CommitError::Storage {
                    source: StorageError::AlreadyExists { .. },
                }) => {
                    ensure!(
                        attempt < MAX_COMMIT_ATTEMPTS,
                        MaxRetryExceededSnafu { attempts: attempt }
                    );

                    let footprint = TransactionFootprint {
                        read_predicates: &self.read_predicates,
                        read_files: &self.read_files,
                        read_whole_table: self.read_whole_table,
                        removed_paths: removed_paths.clone(),
                        txn_app_ids: txn_app_ids.clone(),
                        is_blind_append: isolation == IsolationLevel::SnapshotIsolation,
                        schema: &schema,
                        partition_columns: &partition_columns,
                    };

                    let latest = self
                        .store
                        .latest_version()
                        .await
                        .context(LogSnafu)?
                        .unwrap_or(self.snapshot.version);
                    for winning_version in target..=latest {
                        let winning = self
                            .store
                            .read_commit_actions(winning_version)
                            .await
                            .context(LogSnafu)?;
                        footprint.check(&winning).context(ConflictSnafu)?;
                    }

                    // No conflicts: rebase onto the current tip and retry.
                    self.snapshot = Snapshot::load(&self.store, None)
                        .await
                        .context(LogSnafu)?;
                }
                Err(e) => return Err(e).context(LogSnafu),
            }
        }
    }

    fn validate_and_prepare(
        &self,
        mut actions: Vec<Action>,
        operation: &DeltaOperation,
        metrics: HashMap<String, String>,
    ) -> Result<(Vec<Action>, CommitInfo, IsolationLevel), TransactionError> {
        protocol::ensure_write_supported(&self.snapshot.protocol).context(TxnProtocolSnafu)?;

        let metadata_count = actions
            .iter()
            .filter(|a| matches!(a, Action::Metadata(_)))
            .count();
        ensure!(
            metadata_count <= 1,
            InvalidActionsSnafu {
                msg: format!("{metadata_count} metaData actions in one commit"),
            }
        );
        let protocol_count = actions
            .iter()
            .filter(|a| matches!(a, Action::Protocol(_)))
            .count();
        ensure!(
            protocol_count <= 1,
            InvalidActionsSnafu {
                msg: format!("{protocol_count} protocol actions in one commit"),
            }
        );

        if let Some(new_protocol) = actions.iter().find_map(|a| match a {
            Action::Protocol(p) => Some(*p),
            _ => None,
        }) {
            protocol::ensure_no_downgrade(&self.snapshot.protocol, &new_protocol)
                .context(TxnProtocolSnafu)?;
            protocol::ensure_write_supported(&new_protocol).context(TxnProtocolSnafu)?;
        }

        let mut append_only = self.snapshot.config().append_only;
        if let Some(new_metadata) = actions.iter().find_map(|a| match a {
            Action::Metadata(m) => Some(m),
            _ => None,
        }) {
            let new_schema =
                StructType::from_json(&new_metadata.schema_string).context(TxnSchemaSnafu)?;
            // Setting properties is where unknown/invalid keys are strict.
            let new_config =
                TableConfig::from_configuration(&new_metadata.configuration)
                    .context(TxnConfigSnafu)?;
            append_only = append_only || new_config.append_only;

            if !operation.replaces_schema() {
                let current = self.snapshot.schema().context(TxnSchemaSnafu)?;
                ensure!(
                    compat::is_read_compatible(&current, &new_schema),
                    IncompatibleSchemaChangeSnafu {
                        msg: format!(
                            "schema change by {} is not read-compatible",
                            operation.name()
                        ),
                    }
                );
            }
        }

        {
            let mut seen_adds: HashSet<&str> = HashSet::new();
            for action in &actions {
                match action {
                    Action::Add(a) => {
                        ensure!(
                            seen_adds.insert(a.path.as_str()),
                            DuplicateFilePathSnafu { path: a.path.clone() }
                        );
                        let removed_by_this_commit = actions.iter().any(
                            |other| matches!(other, Action::Remove(r) if r.path == a.path),
                        );
                        ensure!(
                            !self.snapshot.files.contains_key(&a.path) || removed_by_this_commit,
                            DuplicateFilePathSnafu { path: a.path.clone() }
                        );
                    }
                    Action::Remove(r) => {
                        ensure!(
                            !(append_only && r.data_change),
                            AppendOnlyTableSnafu { path: r.path.clone() }
                        );
                    }
                    _ => {}
                }
            }
        }

        let has_reads = self.read_whole_table
            || !self.read_files.is_empty()
            || !self.read_predicates.is_empty();
        let is_blind_append = !has_reads
            && actions.iter().all(|a| {
                matches!(a, Action::Add(_) | Action::Txn(_) | Action::CommitInfo(_))
            });
        let isolation = if is_blind_append {
            IsolationLevel::SnapshotIsolation
        } else {
            IsolationLevel::Serializable
        };

        // Synthesize (or enrich) the provenance record, then keep it out of
        // the action list — it is written as the first line of the commit.
        let mut commit_info = actions
            .iter()
            .position(|a| matches!(a, Action::CommitInfo(_)))
            .map(|i| match actions.remove(i) {
                Action::CommitInfo(ci) => ci,
                _ => unreachable!("position matched CommitInfo"),
            })
            .unwrap_or_default();
        commit_info.timestamp = Utc::now().timestamp_millis();
        commit_info.operation = Some(operation.name().to_string());
        commit_info.operation_parameters = operation.parameters();
        commit_info.isolation_level = Some(isolation.to_string());
        commit_info.is_blind_append = Some(is_blind_append);
        if !metrics.is_empty() {
            commit_info.operation_metrics = Some(metrics);
        }

        Ok((actions, commit_info, isolation))
    }
}

fn encode(version: Version, action: &Action) -> Result<String, TransactionError> {
    action
        .to_line()
        .context(crate::transaction_log::CodecSnafu { version })
        .context(LogSnafu)
}

/// Post-commit checkpoint hook: advisory, failures are logged and dropped.
async fn maybe_checkpoint(store: &LogStore, version: Version, interval: u32) {
    if version <= 0 || version % interval as i64 != 0 {
        return;
    }
    match Snapshot::load(store, Some(version)).await {
        Ok(snapshot) => {
            if let Err(e) = snapshot.write_checkpoint(store).await {
                warn!("checkpoint at version {version} failed (will retry later): {e}");
            }
        }
        Err(e) => {
            warn!("could not load snapshot {version} for checkpointing: {e}");
        }
    }
}
