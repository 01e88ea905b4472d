//! Async helpers for persisting and reading the commit log.
//!
//! This module owns all on-disk interactions with `_delta_log/`:
//! - Writing zero-padded commit files with optimistic concurrency control so
//!   each version is created exactly once.
//! - Listing commit and checkpoint files, with gap detection.
//! - Reading a commit back as raw lines or decoded actions.
//!
//! It deliberately knows nothing about snapshot semantics; higher layers
//! decide which actions to commit and how to fold them.

use std::path::{Path, PathBuf};

use snafu::prelude::*;

use crate::storage::{self, TableLocation};
use crate::transaction_log::actions::{Action, CommitInfo};
use crate::transaction_log::{CodecSnafu, CommitError, CorruptLogSnafu, StorageSnafu};

/// A table version. Versions form a dense sequence starting at 0.
pub type Version = i64;

/// Helper for reading and writing the commit log under a table root.
///
/// Layout:
///   `<root>/_delta_log/00000000000000000000.json`
///   `<root>/_delta_log/00000000000000000010.checkpoint.parquet`
///   `<root>/_delta_log/_last_checkpoint`
#[derive(Debug, Clone)]
pub struct LogStore {
    location: TableLocation,
}

impl LogStore {
    /// Name of the subdirectory containing the commit log.
    pub const LOG_DIR_NAME: &'static str = "_delta_log";
    /// Name of the advisory pointer to the newest checkpoint.
    pub const LAST_CHECKPOINT_FILE_NAME: &'static str = "_last_checkpoint";
    /// Number of digits used in zero-padded log file names.
    pub const VERSION_DIGITS: usize = 20;

    /// Create a new `LogStore` rooted at a table directory.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// Get the table location this store operates on.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    pub(crate) fn commit_rel_path(version: Version) -> PathBuf {
        let file_name = format!("{:0width$}.json", version, width = Self::VERSION_DIGITS);
        Self::log_rel_dir().join(file_name)
    }

    pub(crate) fn checkpoint_rel_path(version: Version) -> PathBuf {
        let file_name = format!(
            "{:0width$}.checkpoint.parquet",
            version,
            width = Self::VERSION_DIGITS
        );
        Self::log_rel_dir().join(file_name)
    }

    pub(crate) fn last_checkpoint_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::LAST_CHECKPOINT_FILE_NAME)
    }

    fn commit_version_from_name(name: &str) -> Option<Version> {
        let stem = name.strip_suffix(".json")?;
        if stem.len() != Self::VERSION_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    fn checkpoint_version_from_name(name: &str) -> Option<Version> {
        let stem = name.strip_suffix(".checkpoint.parquet")?;
        if stem.len() != Self::VERSION_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// Atomically create the commit file for `version`.
    ///
    /// Exactly one writer succeeds for a given version; every other writer
    /// observes `CommitError::Storage { source: AlreadyExists }`. Callers
    /// implementing optimistic concurrency catch that case, re-read the
    /// intervening commits, and either rebase or abort. Nothing else about
    /// the race is signalled and nothing else is needed.
    pub async fn write_commit(
        &self,
        version: Version,
        lines: impl IntoIterator<Item = String>,
    ) -> Result<(), CommitError> {
        let mut payload = String::new();
        for line in lines {
            payload.push_str(&line);
            payload.push('\n');
        }

        let rel = Self::commit_rel_path(version);
        storage::write_new(&self.location, &rel, payload.as_bytes())
            .await
            .context(StorageSnafu)
    }

    /// Read the raw lines of the commit file for `version`.
    pub async fn read_commit_lines(&self, version: Version) -> Result<Vec<String>, CommitError> {
        let rel = Self::commit_rel_path(version);
        let contents = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;

        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Read and decode all actions of the commit file for `version`.
    ///
    /// Decoding is all-or-nothing: every line is parsed before any action is
    /// returned, so a truncated or corrupt file never yields a partial
    /// commit. Lines with unknown discriminators are skipped.
    pub async fn read_commit_actions(&self, version: Version) -> Result<Vec<Action>, CommitError> {
        let lines = self.read_commit_lines(version).await?;

        let mut actions = Vec::with_capacity(lines.len());
        for line in &lines {
            if let Some(action) = Action::parse_line(line).context(CodecSnafu { version })? {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    /// The `CommitInfo` of `version`, if the commit recorded one.
    pub async fn read_commit_info(
        &self,
        version: Version,
    ) -> Result<Option<CommitInfo>, CommitError> {
        let actions = self.read_commit_actions(version).await?;
        Ok(actions.into_iter().find_map(|a| match a {
            Action::CommitInfo(ci) => Some(ci),
            _ => None,
        }))
    }

    /// List commit versions `>= start` in ascending order.
    ///
    /// The returned sequence is verified to be dense; a gap means the log
    /// has been corrupted (or partially vacuumed past `start`) and replay
    /// from `start` would silently skip state, so it fails instead.
    pub async fn list_commit_versions_from(
        &self,
        start: Version,
    ) -> Result<Vec<Version>, CommitError> {
        let names = storage::list_dir(&self.location, &Self::log_rel_dir())
            .await
            .context(StorageSnafu)?;

        let mut versions: Vec<Version> = names
            .iter()
            .filter_map(|n| Self::commit_version_from_name(n))
            .filter(|v| *v >= start)
            .collect();
        versions.sort_unstable();

        for pair in versions.windows(2) {
            if pair[1] != pair[0] + 1 {
                return CorruptLogSnafu {
                    msg: format!(
                        "commit versions are not dense: {} is followed by {}",
                        pair[0], pair[1]
                    ),
                }
                .fail();
            }
        }

        Ok(versions)
    }

    /// The highest committed version, or `None` for a fresh table.
    pub async fn latest_version(&self) -> Result<Option<Version>, CommitError> {
        let names = storage::list_dir(&self.location, &Self::log_rel_dir())
            .await
            .context(StorageSnafu)?;

        Ok(names
            .iter()
            .filter_map(|n| Self::commit_version_from_name(n))
            .max())
    }

    /// List checkpoint versions in ascending order.
    pub async fn list_checkpoint_versions(&self) -> Result<Vec<Version>, CommitError> {
        let names = storage::list_dir(&self.location, &Self::log_rel_dir())
            .await
            .context(StorageSnafu)?;

        let mut versions: Vec<Version> = names
            .iter()
            .filter_map(|n| Self::checkpoint_version_from_name(n))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Whether any commit or checkpoint exists under `_delta_log/`.
    pub async fn log_exists(&self) -> Result<bool, CommitError> {
        let names = storage::list_dir(&self.location, &Self::log_rel_dir())
            .await
            .context(StorageSnafu)?;
        Ok(names.iter().any(|n| {
            Self::commit_version_from_name(n).is_some()
                || Self::checkpoint_version_from_name(n).is_some()
        }))
    }

    /// Whether a `_delta_log` directory exists anywhere strictly above
    /// `location`. Used to reject scans of a partition subdirectory.
    pub async fn ancestor_log_exists(location: &TableLocation) -> bool {
        let TableLocation::Local(root) = location;
        let mut current: Option<&Path> = root.parent();
        while let Some(dir) = current {
            let candidate = TableLocation::local(dir);
            if storage::exists(&candidate, Path::new(Self::LOG_DIR_NAME)).await {
                return true;
            }
            current = dir.parent();
        }
        false
    }
}
