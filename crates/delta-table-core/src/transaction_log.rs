//! Append-only action log and snapshot reconstruction.
//!
//! This module implements the transactional metadata layer: an ordered log
//! of JSON-encoded actions under `_delta_log/` that describes, for each
//! table version, which immutable data files logically belong to it.
//!
//! - Commit files are zero-padded, versioned JSON files
//!   (`_delta_log/00000000000000000042.json`), one action object per line.
//! - Creating a commit file uses "create only if not exists" semantics, so
//!   exactly one writer succeeds for a given version. That single property
//!   is what the optimistic transaction engine builds ACID on.
//! - Periodic checkpoints (`<version>.checkpoint.parquet`) compact replay;
//!   a `_last_checkpoint` pointer records the newest one.
//! - A [`Snapshot`] is reconstructed by folding actions in order, starting
//!   from the newest eligible checkpoint.
//!
//! ## On-disk layout (high level)
//!
//! ```text
//! table_root/
//!   _delta_log/
//!     00000000000000000000.json
//!     00000000000000000001.json
//!     00000000000000000010.checkpoint.parquet
//!     _last_checkpoint
//!   part-00000-....parquet          # data files, tracked by path only
//! ```

pub mod actions;
pub mod checkpoint;
pub mod log_store;
pub mod protocol;
pub mod snapshot;

pub use actions::{
    Action, AddFile, CodecError, CommitInfo, Format, Metadata, Protocol, RemoveFile, Txn,
};
pub use checkpoint::{CheckpointError, LastCheckpoint};
pub use log_store::{LogStore, Version};
pub use protocol::{ProtocolError, SUPPORTED_READER_VERSION, SUPPORTED_WRITER_VERSION};
pub use snapshot::Snapshot;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Underlying storage error while working with the log directory.
    ///
    /// `StorageError::AlreadyExists` on a commit write means another writer
    /// won the version; the transaction layer catches that case and runs
    /// conflict detection instead of surfacing it.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A log line failed to decode.
    #[snafu(display("Corrupt log at version {version}: {source}"))]
    Codec {
        /// The version of the commit file that failed to decode.
        version: Version,
        /// The underlying codec error.
        #[snafu(source, backtrace)]
        source: CodecError,
    },

    /// The log is in an unexpected or malformed state (gaps, truncation,
    /// missing required actions).
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptLog {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A checkpoint that was selected for replay failed to read.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint {
        /// Underlying checkpoint error.
        #[snafu(source, backtrace)]
        source: CheckpointError,
    },
}
