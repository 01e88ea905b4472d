//! Filesystem layout and path utilities.
//!
//! This module centralizes all filesystem- and path-related logic for
//! `delta-table-core`. It is responsible for mapping a table root directory
//! to the locations of the metadata log (`_delta_log/`), individual commit
//! and checkpoint files, and for providing the small set of file primitives
//! the commit protocol depends on:
//!
//! - `write_new`: create-only writes ("create if not exists"), the sole
//!   concurrency primitive the transaction engine relies on.
//! - `write_atomic`: write-then-rename replacement for advisory files such
//!   as `_last_checkpoint`.
//! - reads and directory listing.
//!
//! The API is designed so that future adapters (object storage with
//! compare-and-swap puts) can be introduced without rewriting the log and
//! table logic; the only property a backend must preserve is that
//! `write_new` has at-most-one-success semantics per path.

use snafu::{Backtrace, prelude::*};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Represents the location of a table root.
///
/// This enum abstracts over storage backends, currently supporting local
/// filesystem paths. Object-store variants would slot in here.
#[derive(Clone, Debug)]
pub enum TableLocation {
    /// A table stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// A canonical string form of the location, used as a registry key.
    pub fn canonical_key(&self) -> String {
        match self {
            TableLocation::Local(root) => root
                .canonicalize()
                .unwrap_or_else(|_| root.clone())
                .display()
                .to_string(),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    LocalIo {
        /// The path where the I/O error occurred.
        path: String,
        /// The underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Join a table location with a relative path into an absolute local path.
fn join_local(location: &TableLocation, rel: &Path) -> PathBuf {
    match location {
        TableLocation::Local(root) => root.join(rel),
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).await.context(LocalIoSnafu {
            path: parent.display().to_string(),
        })?;
    }
    Ok(())
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// This performs a write-then-rename sequence: the payload goes to a
/// temporary file next to the target path, is synced, and then renamed into
/// place. Used for advisory pointers that may be overwritten
/// (`_last_checkpoint`), never for commit files.
pub async fn write_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            create_parent_dir(&abs).await?;

            let tmp_path = abs.with_extension("tmp");

            {
                let mut file = fs::File::create(&tmp_path).await.context(LocalIoSnafu {
                    path: tmp_path.display().to_string(),
                })?;

                file.write_all(contents).await.context(LocalIoSnafu {
                    path: tmp_path.display().to_string(),
                })?;

                file.sync_all().await.context(LocalIoSnafu {
                    path: tmp_path.display().to_string(),
                })?;
            }

            fs::rename(&tmp_path, &abs).await.context(LocalIoSnafu {
                path: abs.display().to_string(),
            })?;

            Ok(())
        }
    }
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file exists.
///
/// This is the serialization point for commits: exactly one writer succeeds
/// for a given path.
pub async fn write_new(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        StorageError::AlreadyExists {
                            path: abs.display().to_string(),
                            backtrace: Backtrace::capture(),
                        }
                    } else {
                        StorageError::LocalIo {
                            path: abs.display().to_string(),
                            source: e,
                            backtrace: Backtrace::capture(),
                        }
                    }
                })?;

            file.write_all(contents).await.context(LocalIoSnafu {
                path: abs.display().to_string(),
            })?;

            file.sync_all().await.context(LocalIoSnafu {
                path: abs.display().to_string(),
            })?;

            Ok(())
        }
    }
}

/// Read the file at `rel_path` within `location` as a `String`.
pub async fn read_to_string(location: &TableLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            match fs::read_to_string(&abs).await {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == io::ErrorKind::NotFound => NotFoundSnafu {
                    path: abs.display().to_string(),
                }
                .fail(),
                Err(e) => Err(e).context(LocalIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Read the file at `rel_path` within `location` as raw bytes.
pub async fn read_bytes(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            match fs::read(&abs).await {
                Ok(b) => Ok(b),
                Err(e) if e.kind() == io::ErrorKind::NotFound => NotFoundSnafu {
                    path: abs.display().to_string(),
                }
                .fail(),
                Err(e) => Err(e).context(LocalIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// List the file names (not paths) directly under `rel_dir`.
///
/// A missing directory is treated as empty; this is how a fresh table with
/// no `_delta_log/` reads as "no versions yet".
pub async fn list_dir(location: &TableLocation, rel_dir: &Path) -> StorageResult<Vec<String>> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_dir);

            let mut entries = match fs::read_dir(&abs).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(e).context(LocalIoSnafu {
                        path: abs.display().to_string(),
                    });
                }
            };

            let mut names = Vec::new();
            loop {
                let entry = entries.next_entry().await.context(LocalIoSnafu {
                    path: abs.display().to_string(),
                })?;
                match entry {
                    Some(entry) => {
                        if let Some(name) = entry.file_name().to_str() {
                            names.push(name.to_string());
                        }
                    }
                    None => break,
                }
            }
            names.sort();
            Ok(names)
        }
    }
}

/// Whether a file or directory exists at `rel_path` under `location`.
pub async fn exists(location: &TableLocation, rel_path: &Path) -> bool {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::try_exists(&abs).await.unwrap_or(false)
        }
    }
}
