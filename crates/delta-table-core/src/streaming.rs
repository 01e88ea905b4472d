//! Incremental streaming source.
//!
//! Models the table as a logically infinite sequence of data-changing
//! `AddFile`s with stable ordering `(version, index)`, where `index` is the
//! position of the file among its version's data-changing adds. A stream
//! starts either by backfilling the current snapshot as one synthetic
//! version (files attributed to the snapshot version, ordered by
//! modification time then path) or at a configured version/timestamp, and
//! then tails the log version by version.
//!
//! Admission control bounds each micro-batch by file count, byte volume,
//! both, or nothing. When a batch ends exactly on a version's last file the
//! committed offset bumps to `(version + 1, -1)` so the next batch never
//! re-reads the finished version.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::schema::{compat, SchemaError, StructType};
use crate::transaction_log::actions::{Action, AddFile};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::{protocol, CommitError, ProtocolError, Snapshot};

/// Default bound on files per micro-batch.
pub const DEFAULT_MAX_FILES_PER_TRIGGER: usize = 1000;

/// Sentinel index meaning "before the first AddFile of this version".
pub const BEFORE_FIRST_INDEX: i64 = -1;

/// A position in the stream: the next read starts strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOffset {
    /// Identifier of the table this offset belongs to.
    pub table_id: String,
    /// The version the offset points into.
    pub reservoir_version: Version,
    /// Index of the last consumed AddFile within the version, or
    /// [`BEFORE_FIRST_INDEX`].
    pub index: i64,
    /// Whether the offset still points into the initial-snapshot backfill.
    pub is_starting_version: bool,
}

/// Per-trigger admission bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Maximum number of files; `None` is unbounded.
    pub max_files: Option<usize>,
    /// Maximum total bytes; `None` is unbounded.
    pub max_bytes: Option<i64>,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_files: Some(DEFAULT_MAX_FILES_PER_TRIGGER),
            max_bytes: None,
        }
    }
}

impl AdmissionLimits {
    /// No bounds: drain everything available.
    pub fn read_all_available() -> Self {
        Self {
            max_files: None,
            max_bytes: None,
        }
    }

    /// Whether another file of `size` bytes may be admitted.
    ///
    /// A batch always admits at least one file, otherwise a file larger
    /// than `max_bytes` would wedge the stream.
    fn admits(&self, files_taken: usize, bytes_taken: i64, size: i64) -> bool {
        if files_taken == 0 {
            return true;
        }
        if let Some(max_files) = self.max_files {
            if files_taken >= max_files {
                return false;
            }
        }
        if let Some(max_bytes) = self.max_bytes {
            if bytes_taken + size > max_bytes {
                return false;
            }
        }
        true
    }
}

/// Where a stream starts when no offset has been committed yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartingPosition {
    /// Backfill the current snapshot, then tail.
    #[default]
    Snapshot,
    /// Tail from the given version (inclusive).
    Version(Version),
    /// Only future commits.
    Latest,
    /// Tail from the earliest commit whose timestamp (ms) is `>=` the
    /// given one, or from the next commit if none is yet.
    Timestamp(i64),
}

/// Streaming source options.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Tolerate versions that rewrite data (update/merge/delete rewrites).
    pub ignore_changes: bool,
    /// Tolerate pure-deletion versions.
    pub ignore_deletes: bool,
    /// Starting position for a fresh stream.
    pub starting: StartingPosition,
}

/// An AddFile with its stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedFile {
    /// Version the file was committed in (or attributed to, for backfill).
    pub version: Version,
    /// Position among the version's data-changing adds.
    pub index: i64,
    /// The file itself.
    pub add: AddFile,
}

/// One admitted micro-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroBatch {
    /// Offset the batch started from (exclusive).
    pub start: Option<StreamOffset>,
    /// Offset committed after the batch (inclusive of its last file).
    pub end: StreamOffset,
    /// Files in `(version, index)` order.
    pub files: Vec<IndexedFile>,
}

/// Errors raised by the streaming source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    /// Log access failure.
    #[snafu(display("Transaction log error in stream: {source}"))]
    StreamLog {
        /// Underlying log error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// A version rewrote data and `ignore_changes` is off.
    #[snafu(display(
        "Detected a data update in version {version}; \
         set ignore_changes to continue past rewrites"
    ))]
    IgnoreChanges {
        /// The offending version.
        version: Version,
    },

    /// A version deleted data and `ignore_deletes` is off.
    #[snafu(display(
        "Detected deleted data in version {version}; \
         set ignore_deletes to continue past deletions"
    ))]
    IgnoreDeletes {
        /// The offending version.
        version: Version,
    },

    /// The table schema changed incompatibly mid-stream.
    #[snafu(display(
        "Schema changed in version {version} is not compatible with the stream's schema; \
         restart the stream to pick it up"
    ))]
    SchemaChanged {
        /// The version carrying the new schema.
        version: Version,
    },

    /// The protocol gate rejected the stream.
    #[snafu(display("Protocol error in stream: {source}"))]
    StreamProtocol {
        /// Underlying protocol error.
        #[snafu(source)]
        source: ProtocolError,
    },

    /// The stream's bound schema failed to parse.
    #[snafu(display("Schema error in stream: {source}"))]
    StreamSchema {
        /// Underlying schema error.
        #[snafu(source)]
        source: SchemaError,
    },
}

fn at_capacity(limits: &AdmissionLimits, files: usize, bytes: i64) -> bool {
    if files == 0 {
        return false;
    }
    limits.max_files.is_some_and(|m| files >= m)
        || limits.max_bytes.is_some_and(|m| bytes >= m)
}

/// An offset-tracked incremental reader over one table.
#[derive(Debug)]
pub struct StreamingSource {
    store: LogStore,
    options: StreamOptions,
    table_id: String,
    bound_schema: StructType,
    committed: Option<StreamOffset>,
}

impl StreamingSource {
    /// Bind a stream to the table's current snapshot.
    pub async fn new(store: LogStore, options: StreamOptions) -> Result<Self, StreamError> {
        let snapshot = Snapshot::load(&store, None).await.context(StreamLogSnafu)?;
        protocol::ensure_read_supported(&snapshot.protocol).context(StreamProtocolSnafu)?;
        let bound_schema = snapshot.schema().context(StreamSchemaSnafu)?;

        Ok(Self {
            store,
            options,
            table_id: snapshot.metadata.id.clone(),
            bound_schema,
            committed: None,
        })
    }

    /// The last committed offset, if the stream has produced a batch.
    pub fn committed_offset(&self) -> Option<&StreamOffset> {
        self.committed.as_ref()
    }

    fn offset(&self, version: Version, index: i64, is_starting_version: bool) -> StreamOffset {
        StreamOffset {
            table_id: self.table_id.clone(),
            reservoir_version: version,
            index,
            is_starting_version,
        }
    }

    async fn initial_offset(&self) -> Result<StreamOffset, StreamError> {
        match &self.options.starting {
            StartingPosition::Snapshot => {
                let snapshot = Snapshot::load(&self.store, None)
                    .await
                    .context(StreamLogSnafu)?;
                Ok(self.offset(snapshot.version, BEFORE_FIRST_INDEX, true))
            }
            StartingPosition::Version(v) => Ok(self.offset(*v, BEFORE_FIRST_INDEX, false)),
            StartingPosition::Latest => {
                let latest = self
                    .store
                    .latest_version()
                    .await
                    .context(StreamLogSnafu)?
                    .unwrap_or(-1);
                Ok(self.offset(latest + 1, BEFORE_FIRST_INDEX, false))
            }
            StartingPosition::Timestamp(ts) => {
                let latest = self
                    .store
                    .latest_version()
                    .await
                    .context(StreamLogSnafu)?
                    .unwrap_or(-1);
                for version in 0..=latest {
                    let info = self
                        .store
                        .read_commit_info(version)
                        .await
                        .context(StreamLogSnafu)?;
                    if info.is_some_and(|i| i.timestamp >= *ts) {
                        return Ok(self.offset(version, BEFORE_FIRST_INDEX, false));
                    }
                }
                Ok(self.offset(latest + 1, BEFORE_FIRST_INDEX, false))
            }
        }
    }

    /// Produce the next micro-batch, advancing the committed offset.
    ///
    /// Returns `None` when nothing new is available. Files are emitted in
    /// strictly increasing `(version, index)` order with no duplicates and
    /// no gaps.
    pub async fn next_batch(
        &mut self,
        limits: AdmissionLimits,
    ) -> Result<Option<MicroBatch>, StreamError> {
        let start = match &self.committed {
            Some(offset) => offset.clone(),
            None => self.initial_offset().await?,
        };

        let mut files: Vec<IndexedFile> = Vec::new();
        let mut bytes: i64 = 0;
        let mut cursor = start.clone();
        let mut exhausted_limits = false;

        if cursor.is_starting_version {
            let snapshot = Snapshot::load(&self.store, Some(cursor.reservoir_version))
                .await
                .context(StreamLogSnafu)?;

            let mut backfill: Vec<&AddFile> = snapshot.files.values().collect();
            backfill.sort_by(|a, b| {
                (a.modification_time, a.path.as_str()).cmp(&(b.modification_time, b.path.as_str()))
            });

            for (i, add) in backfill.into_iter().enumerate() {
                let index = i as i64;
                if index <= cursor.index {
                    continue;
                }
                if !limits.admits(files.len(), bytes, add.size) {
                    exhausted_limits = true;
                    break;
                }
                bytes += add.size;
                files.push(IndexedFile {
                    version: cursor.reservoir_version,
                    index,
                    add: add.clone(),
                });
                cursor.index = index;
            }

            if !exhausted_limits {
                // Backfill done: bump past the snapshot version.
                cursor = self.offset(cursor.reservoir_version + 1, BEFORE_FIRST_INDEX, false);
            }
        }

        if !cursor.is_starting_version && !exhausted_limits {
            let latest = self
                .store
                .latest_version()
                .await
                .context(StreamLogSnafu)?
                .unwrap_or(-1);

            let mut version = cursor.reservoir_version;
            while version <= latest && !exhausted_limits {
                // A full batch stops before touching (and hygiene-checking)
                // the next version.
                if at_capacity(&limits, files.len(), bytes) {
                    break;
                }

                let actions = self
                    .store
                    .read_commit_actions(version)
                    .await
                    .context(StreamLogSnafu)?;
                self.check_version_hygiene(version, &actions)?;

                let adds: Vec<&AddFile> = actions
                    .iter()
                    .filter_map(|a| match a {
                        Action::Add(add) if add.data_change => Some(add),
                        _ => None,
                    })
                    .collect();

                let skip_through = if version == cursor.reservoir_version {
                    cursor.index
                } else {
                    BEFORE_FIRST_INDEX
                };

                for (i, add) in adds.into_iter().enumerate() {
                    let index = i as i64;
                    if index <= skip_through {
                        continue;
                    }
                    if !limits.admits(files.len(), bytes, add.size) {
                        exhausted_limits = true;
                        break;
                    }
                    bytes += add.size;
                    files.push(IndexedFile {
                        version,
                        index,
                        add: add.clone(),
                    });
                    cursor = self.offset(version, index, false);
                }

                if !exhausted_limits {
                    // Finished the version: the committed offset skips past
                    // it so it is never re-read.
                    cursor = self.offset(version + 1, BEFORE_FIRST_INDEX, false);
                    version += 1;
                }
            }
        }

        // The offset advances even over dataless versions (metadata-only
        // commits, tolerated deletions) so they are never re-examined.
        if cursor != start {
            self.committed = Some(cursor.clone());
        }
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(MicroBatch {
            start: Some(start),
            end: cursor,
            files,
        }))
    }

    /// Per-version hygiene: reject rewrites/deletions unless tolerated,
    /// re-validate schema and protocol changes.
    fn check_version_hygiene(
        &self,
        version: Version,
        actions: &[Action],
    ) -> Result<(), StreamError> {
        let has_data_add = actions
            .iter()
            .any(|a| matches!(a, Action::Add(add) if add.data_change));
        let has_data_remove = actions
            .iter()
            .any(|a| matches!(a, Action::Remove(r) if r.data_change));

        if has_data_remove && !self.options.ignore_changes {
            if has_data_add {
                return IgnoreChangesSnafu { version }.fail();
            }
            if !self.options.ignore_deletes {
                return IgnoreDeletesSnafu { version }.fail();
            }
        }

        for action in actions {
            match action {
                Action::Metadata(m) => {
                    let new_schema =
                        StructType::from_json(&m.schema_string).context(StreamSchemaSnafu)?;
                    ensure!(
                        compat::is_read_compatible(&self.bound_schema, &new_schema),
                        SchemaChangedSnafu { version }
                    );
                }
                Action::Protocol(p) => {
                    protocol::ensure_read_supported(p).context(StreamProtocolSnafu)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
