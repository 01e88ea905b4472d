//! Checkpoint files and the `_last_checkpoint` pointer.
//!
//! A checkpoint compacts the snapshot state at some version into one
//! columnar file so replay can start there instead of at version 0. The
//! encoding is a Parquet file with a single non-nullable Utf8 column
//! `action`, one serialized action JSON per row — the same line format as
//! the delta files, just stored columnar and compressed.
//!
//! Checkpoints are strictly advisory: a missing, stale, or unreadable
//! checkpoint only makes replay slower, never incorrect. Write failures are
//! therefore logged and swallowed by callers rather than failing the commit
//! that triggered them.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use log::warn;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::storage::{self, StorageError, TableLocation};
use crate::transaction_log::actions::{Action, CodecError};
use crate::transaction_log::log_store::{LogStore, Version};

/// Contents of the `_last_checkpoint` pointer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCheckpoint {
    /// Version the checkpoint captures.
    pub version: Version,
    /// Number of actions stored in the checkpoint.
    pub size: i64,
}

/// Errors raised while writing or reading checkpoints.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckpointError {
    /// Storage failure while reading or writing checkpoint files.
    #[snafu(display("Storage error while accessing checkpoint: {source}"))]
    CheckpointStorage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Parquet encode/decode failure.
    #[snafu(display("Parquet error in checkpoint: {source}"))]
    Parquet {
        /// Underlying Parquet error.
        source: ParquetError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Arrow batch construction failure.
    #[snafu(display("Arrow error in checkpoint: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// An action row inside the checkpoint failed to decode.
    #[snafu(display("Corrupt checkpoint at version {version}: {source}"))]
    CheckpointCodec {
        /// Checkpoint version.
        version: Version,
        /// Underlying codec error.
        #[snafu(source, backtrace)]
        source: CodecError,
    },

    /// The checkpoint file has an unexpected shape.
    #[snafu(display("Corrupt checkpoint at version {version}: {msg}"))]
    CheckpointShape {
        /// Checkpoint version.
        version: Version,
        /// What was wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The `_last_checkpoint` pointer failed to encode.
    #[snafu(display("Failed to encode _last_checkpoint: {source}"))]
    PointerCodec {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

fn checkpoint_arrow_schema() -> Arc<ArrowSchema> {
    Arc::new(ArrowSchema::new(vec![Field::new(
        "action",
        ArrowDataType::Utf8,
        false,
    )]))
}

/// Serialize `actions` into the checkpoint file for `version` and advance
/// the `_last_checkpoint` pointer.
pub async fn write_checkpoint(
    location: &TableLocation,
    version: Version,
    actions: &[Action],
) -> Result<LastCheckpoint, CheckpointError> {
    let mut lines = Vec::with_capacity(actions.len());
    for action in actions {
        lines.push(
            action
                .to_line()
                .context(CheckpointCodecSnafu { version })?,
        );
    }

    let schema = checkpoint_arrow_schema();
    let column = StringArray::from_iter_values(lines.iter().map(String::as_str));
    let batch =
        RecordBatch::try_new(schema.clone(), vec![Arc::new(column)]).context(ArrowSnafu)?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).context(ParquetSnafu)?;
    writer.write(&batch).context(ParquetSnafu)?;
    writer.close().context(ParquetSnafu)?;

    let rel = LogStore::checkpoint_rel_path(version);
    storage::write_atomic(location, &rel, &buffer)
        .await
        .context(CheckpointStorageSnafu)?;

    let pointer = LastCheckpoint {
        version,
        size: actions.len() as i64,
    };
    let pointer_json = serde_json::to_string(&pointer).context(PointerCodecSnafu)?;
    storage::write_atomic(
        location,
        &LogStore::last_checkpoint_rel_path(),
        pointer_json.as_bytes(),
    )
    .await
    .context(CheckpointStorageSnafu)?;

    Ok(pointer)
}

/// Read back the actions stored in the checkpoint for `version`.
pub async fn read_checkpoint(
    location: &TableLocation,
    version: Version,
) -> Result<Vec<Action>, CheckpointError> {
    let rel = LogStore::checkpoint_rel_path(version);
    let bytes = storage::read_bytes(location, &rel)
        .await
        .context(CheckpointStorageSnafu)?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .context(ParquetSnafu)?
        .build()
        .context(ParquetSnafu)?;

    let mut actions = Vec::new();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .context(CheckpointShapeSnafu {
                version,
                msg: "first column is not Utf8".to_string(),
            })?;
        for i in 0..column.len() {
            let line = column.value(i);
            if let Some(action) =
                Action::parse_line(line).context(CheckpointCodecSnafu { version })?
            {
                actions.push(action);
            }
        }
    }
    Ok(actions)
}

/// Read the `_last_checkpoint` pointer.
///
/// The pointer is advisory: a missing file is `None`, and a corrupt file is
/// logged and treated as missing so readers fall back to listing.
pub async fn read_last_checkpoint(location: &TableLocation) -> Option<LastCheckpoint> {
    let rel: &Path = &LogStore::last_checkpoint_rel_path();
    let contents = match storage::read_to_string(location, rel).await {
        Ok(s) => s,
        Err(StorageError::NotFound { .. }) => return None,
        Err(e) => {
            warn!("failed to read _last_checkpoint, falling back to listing: {e}");
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(pointer) => Some(pointer),
        Err(e) => {
            warn!("malformed _last_checkpoint, falling back to listing: {e}");
            None
        }
    }
}
