//! Table handles.
//!
//! [`DeltaLog`] is the per-table handle: it owns the log store and caches
//! the latest snapshot behind a monotonic `update()`. Readers share the
//! cached snapshot without locking (it is immutable behind an `Arc`);
//! writers start transactions from it. [`DeltaTable`] wraps a handle with
//! the user-facing verbs (append / delete / update / merge / history /
//! time travel).
//!
//! Handles are never process-global: a [`registry::TableRegistry`] owned by
//! the embedding context deduplicates handles per table path and is
//! responsible for eviction.

pub mod registry;

pub use registry::TableRegistry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use snafu::prelude::*;
use snafu::IntoError;
use tokio::sync::RwLock;

use crate::config::{ConfigError, TableConfig};
use crate::expr::Expr;
use crate::merge::MergeBuilder;
use crate::operations::delete::{self, DeleteMetrics};
use crate::operations::update::{self, UpdateMetrics};
use crate::operations::{write, DmlError};
use crate::runtime::{QueryRuntime, Row};
use crate::schema::{SchemaError, StructType, UnknownColumnSnafu};
use crate::storage::TableLocation;
use crate::streaming;
use crate::transaction::{DeltaOperation, OptimisticTransaction};
use crate::transaction_log::actions::{Action, CommitInfo, Format, Metadata};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::{protocol, CommitError, ProtocolError, Snapshot};

/// Errors from high-level table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Log access or replay failure.
    #[snafu(display("Transaction log error: {source}"))]
    TableLog {
        /// Underlying log error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Schema failure.
    #[snafu(display("Schema error: {source}"))]
    TableSchema {
        /// Underlying schema error.
        #[snafu(source)]
        source: SchemaError,
    },

    /// Protocol gate rejection on read.
    #[snafu(display("Protocol error: {source}"))]
    TableProtocol {
        /// Underlying protocol error.
        #[snafu(source)]
        source: ProtocolError,
    },

    /// Table property failure at creation/alteration.
    #[snafu(display("Table property error: {source}"))]
    TableProperty {
        /// Underlying config error.
        #[snafu(source)]
        source: ConfigError,
    },

    /// DML failure.
    #[snafu(display("{source}"))]
    Dml {
        /// Underlying DML error.
        #[snafu(source)]
        source: DmlError,
    },

    /// The location carries no `_delta_log`.
    #[snafu(display("Not a delta table: {location}"))]
    NotATable {
        /// The offending location.
        location: String,
    },

    /// The location is a subdirectory of a table; partial scans are
    /// rejected, the table must be read at its root.
    #[snafu(display(
        "{location} is inside a delta table; scan the table at its root instead"
    ))]
    PartialTableScan {
        /// The offending location.
        location: String,
    },

    /// Creation attempted over an existing table.
    #[snafu(display("Table already exists at version {version}"))]
    TableAlreadyExists {
        /// The existing table's current version.
        version: Version,
    },
}

static TABLE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique-enough table identifier without an external id dependency.
fn generate_table_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let count = TABLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:016x}-{count:08x}")
}

/// Whether `location` holds a delta table (a log with at least one commit
/// or checkpoint).
pub async fn is_delta_table(location: &TableLocation) -> bool {
    LogStore::new(location.clone())
        .log_exists()
        .await
        .unwrap_or(false)
}

/// Per-table handle: log store plus cached latest snapshot.
#[derive(Debug)]
pub struct DeltaLog {
    location: TableLocation,
    store: LogStore,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl DeltaLog {
    /// Open the table at `location`, loading and gate-checking the latest
    /// snapshot.
    pub async fn open(location: TableLocation) -> Result<Arc<Self>, TableError> {
        let store = LogStore::new(location.clone());

        if !store.log_exists().await.context(TableLogSnafu)? {
            if LogStore::ancestor_log_exists(&location).await {
                return PartialTableScanSnafu {
                    location: location.canonical_key(),
                }
                .fail();
            }
            return NotATableSnafu {
                location: location.canonical_key(),
            }
            .fail();
        }

        let snapshot = Snapshot::load(&store, None).await.context(TableLogSnafu)?;
        protocol::ensure_read_supported(&snapshot.protocol).context(TableProtocolSnafu)?;

        Ok(Arc::new(Self {
            location,
            store,
            snapshot: RwLock::new(Arc::new(snapshot)),
        }))
    }

    /// The table's location.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    /// The underlying log store.
    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// The cached snapshot (no I/O).
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Refresh the cached snapshot to the latest version.
    ///
    /// Updates are monotonic: a concurrent refresh that already installed a
    /// newer snapshot is never rolled back.
    pub async fn update(&self) -> Result<Arc<Snapshot>, TableError> {
        let latest = Snapshot::load(&self.store, None).await.context(TableLogSnafu)?;
        protocol::ensure_read_supported(&latest.protocol).context(TableProtocolSnafu)?;

        let mut cached = self.snapshot.write().await;
        if latest.version > cached.version {
            *cached = Arc::new(latest);
        }
        Ok(cached.clone())
    }

    /// Load the snapshot at a historic version (time travel).
    pub async fn snapshot_at(&self, version: Version) -> Result<Snapshot, TableError> {
        let snapshot = Snapshot::load(&self.store, Some(version))
            .await
            .context(TableLogSnafu)?;
        protocol::ensure_read_supported(&snapshot.protocol).context(TableProtocolSnafu)?;
        Ok(snapshot)
    }

    /// Start an optimistic transaction from the current snapshot.
    pub async fn begin_transaction(&self) -> OptimisticTransaction {
        let snapshot = self.snapshot().await;
        OptimisticTransaction::new(self.store.clone(), (*snapshot).clone())
    }

    /// Commit provenance of each version, newest first.
    pub async fn history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<(Version, CommitInfo)>, TableError> {
        let latest = self
            .store
            .latest_version()
            .await
            .context(TableLogSnafu)?
            .unwrap_or(-1);

        let mut entries = Vec::new();
        let mut version = latest;
        while version >= 0 {
            if limit.is_some_and(|l| entries.len() >= l) {
                break;
            }
            if let Some(info) = self
                .store
                .read_commit_info(version)
                .await
                .context(TableLogSnafu)?
            {
                entries.push((version, info));
            }
            version -= 1;
        }
        Ok(entries)
    }
}

/// User-facing table: a handle plus the DML verbs.
#[derive(Debug, Clone)]
pub struct DeltaTable {
    log: Arc<DeltaLog>,
}

impl DeltaTable {
    /// Open an existing table.
    pub async fn open(location: TableLocation) -> Result<Self, TableError> {
        Ok(Self {
            log: DeltaLog::open(location).await?,
        })
    }

    /// Wrap an already-opened handle.
    pub fn from_log(log: Arc<DeltaLog>) -> Self {
        Self { log }
    }

    /// Create a new table with an initial metadata commit at version 0.
    pub async fn create(
        location: TableLocation,
        schema: StructType,
        partition_columns: Vec<String>,
        configuration: HashMap<String, String>,
    ) -> Result<Self, TableError> {
        let store = LogStore::new(location.clone());

        if let Some(version) = store.latest_version().await.context(TableLogSnafu)? {
            return TableAlreadyExistsSnafu { version }.fail();
        }

        // Partition columns must name top-level schema fields.
        for column in &partition_columns {
            if schema.field(column).is_none() {
                let source = UnknownColumnSnafu {
                    name: column.clone(),
                }
                .build();
                return Err(TableSchemaSnafu.into_error(source));
            }
        }
        // Properties are strict at creation time.
        TableConfig::from_configuration(&configuration).context(TablePropertySnafu)?;

        let effective = protocol::effective_protocol(None, &schema, &configuration);
        let metadata = Metadata {
            id: generate_table_id(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string: schema.to_json().context(TableSchemaSnafu)?,
            partition_columns,
            configuration,
            created_time: Some(Utc::now().timestamp_millis()),
        };

        let operation = DeltaOperation::CreateTable { as_select: false };
        let commit_info = CommitInfo {
            timestamp: Utc::now().timestamp_millis(),
            operation: Some(operation.name().to_string()),
            operation_parameters: operation.parameters(),
            ..CommitInfo::default()
        };

        let lines: Vec<String> = [
            Action::CommitInfo(commit_info),
            Action::Protocol(effective),
            Action::Metadata(metadata),
        ]
        .iter()
        .map(|a| {
            a.to_line()
                .context(crate::transaction_log::CodecSnafu { version: 0i64 })
                .context(TableLogSnafu)
        })
        .collect::<Result<_, _>>()?;

        match store.write_commit(0, lines).await {
            Ok(()) => {}
            Err(CommitError::Storage {
                source: crate::storage::StorageError::AlreadyExists { .. },
            }) => {
                // Someone else created it between the check and the write.
                return TableAlreadyExistsSnafu { version: 0i64 }.fail();
            }
            Err(e) => return Err(e).context(TableLogSnafu),
        }

        Self::open(location).await
    }

    /// The underlying handle.
    pub fn log(&self) -> &Arc<DeltaLog> {
        &self.log
    }

    /// The current cached snapshot.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.log.snapshot().await
    }

    /// The current cached version.
    pub async fn version(&self) -> Version {
        self.log.snapshot().await.version
    }

    /// Append rows as a blind-append commit.
    pub async fn append(
        &self,
        runtime: &dyn QueryRuntime,
        rows: Vec<Row>,
    ) -> Result<Version, TableError> {
        let snapshot = self.log.update().await?;
        let version = write::append_rows(self.log.store(), (*snapshot).clone(), runtime, rows)
            .await
            .context(DmlSnafu)?;
        self.log.update().await?;
        Ok(version)
    }

    /// Delete rows (or whole files, when the predicate allows it).
    pub async fn delete(
        &self,
        runtime: &dyn QueryRuntime,
        predicate: Option<Expr>,
    ) -> Result<(Version, DeleteMetrics), TableError> {
        let snapshot = self.log.update().await?;
        let result = delete::delete(self.log.store(), (*snapshot).clone(), runtime, predicate)
            .await
            .context(DmlSnafu)?;
        self.log.update().await?;
        Ok(result)
    }

    /// File-level delete restricted to partition predicates.
    pub async fn delete_partitions(
        &self,
        runtime: &dyn QueryRuntime,
        predicate: Expr,
    ) -> Result<(Version, DeleteMetrics), TableError> {
        let snapshot = self.log.update().await?;
        let result =
            delete::delete_partitions(self.log.store(), (*snapshot).clone(), runtime, predicate)
                .await
                .context(DmlSnafu)?;
        self.log.update().await?;
        Ok(result)
    }

    /// Update rows matching `predicate` with SET assignments.
    pub async fn update(
        &self,
        runtime: &dyn QueryRuntime,
        predicate: Option<Expr>,
        assignments: HashMap<String, Expr>,
    ) -> Result<(Version, UpdateMetrics), TableError> {
        let snapshot = self.log.update().await?;
        let result = update::update(
            self.log.store(),
            (*snapshot).clone(),
            runtime,
            predicate,
            assignments,
        )
        .await
        .context(DmlSnafu)?;
        self.log.update().await?;
        Ok(result)
    }

    /// Start building a MERGE of `source_rows` into this table.
    pub async fn merge(
        &self,
        source_columns: Vec<String>,
        source_rows: Vec<Row>,
        condition: Expr,
    ) -> Result<MergeBuilder, TableError> {
        let snapshot = self.log.update().await?;
        Ok(MergeBuilder::new(
            self.log.store().clone(),
            (*snapshot).clone(),
            source_columns,
            source_rows,
            condition,
        ))
    }

    /// Commit provenance, newest first.
    pub async fn history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<(Version, CommitInfo)>, TableError> {
        self.log.history(limit).await
    }

    /// Open an incremental streaming source over this table.
    pub async fn stream(
        &self,
        options: streaming::StreamOptions,
    ) -> Result<streaming::StreamingSource, streaming::StreamError> {
        streaming::StreamingSource::new(self.log.store().clone(), options).await
    }
}
