//! Reconstructing table state by replaying the log.
//!
//! A [`Snapshot`] materializes the state at one version by folding actions
//! in order, starting from the newest eligible checkpoint (or version 0).
//! Replay is a pure left-fold: `Metadata`/`Protocol` are last-wins,
//! `Add`/`Remove` maintain the live file set, `Txn` watermarks are last-wins
//! per application, and `CommitInfo` is ignored. Tombstones are retained so
//! time-travel readers never see a re-added phantom; they are dropped only
//! when a checkpoint is written past their retention horizon.
//!
//! A snapshot is immutable. Mutation happens by committing a new version and
//! loading a new snapshot.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use snafu::prelude::*;

use crate::config::TableConfig;
use crate::schema::{SchemaError, StructType};
use crate::transaction_log::actions::{Action, AddFile, Metadata, Protocol, RemoveFile, Txn};
use crate::transaction_log::checkpoint::{self, LastCheckpoint};
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::{CheckpointSnafu, CommitError, CorruptLogSnafu};

/// Immutable view of table state at a specific version.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The highest log version folded into this state.
    pub version: Version,
    /// Effective table metadata (required; last wins).
    pub metadata: Metadata,
    /// Effective protocol (required; last wins).
    pub protocol: Protocol,
    /// Live data files keyed by path.
    pub files: HashMap<String, AddFile>,
    /// Tombstones retained for time-travel correctness, keyed by path.
    pub tombstones: HashMap<String, RemoveFile>,
    /// Application transaction watermarks keyed by `app_id`.
    pub app_transactions: HashMap<String, Txn>,
}

/// Mutable accumulator used during replay; [`Snapshot`] is its sealed form.
#[derive(Debug, Default)]
struct ReplayState {
    metadata: Option<Metadata>,
    protocol: Option<Protocol>,
    files: HashMap<String, AddFile>,
    tombstones: HashMap<String, RemoveFile>,
    app_transactions: HashMap<String, Txn>,
}

impl ReplayState {
    fn apply(&mut self, action: Action) {
        match action {
            Action::Metadata(m) => self.metadata = Some(m),
            Action::Protocol(p) => self.protocol = Some(p),
            Action::Add(a) => {
                self.tombstones.remove(&a.path);
                self.files.insert(a.path.clone(), a);
            }
            Action::Remove(r) => {
                self.files.remove(&r.path);
                self.tombstones.insert(r.path.clone(), r);
            }
            Action::Txn(t) => {
                self.app_transactions.insert(t.app_id.clone(), t);
            }
            Action::CommitInfo(_) => {}
        }
    }

    fn seal(self, version: Version) -> Result<Snapshot, CommitError> {
        let metadata = self.metadata.context(CorruptLogSnafu {
            msg: format!("no metaData action found in commits up to version {version}"),
        })?;
        let protocol = self.protocol.context(CorruptLogSnafu {
            msg: format!("no protocol action found in commits up to version {version}"),
        })?;

        Ok(Snapshot {
            version,
            metadata,
            protocol,
            files: self.files,
            tombstones: self.tombstones,
            app_transactions: self.app_transactions,
        })
    }
}

impl Snapshot {
    /// Load the snapshot at `target` (or the latest version when `None`).
    ///
    /// Replay starts at the newest checkpoint with version `<= target`. A
    /// checkpoint that fails to read is logged and skipped — replay falls
    /// back to version 0, slower but never incorrect.
    pub async fn load(store: &LogStore, target: Option<Version>) -> Result<Self, CommitError> {
        let latest = store.latest_version().await?.context(CorruptLogSnafu {
            msg: "cannot load snapshot: table has no commits".to_string(),
        })?;

        let target = match target {
            None => latest,
            Some(t) if t <= latest && t >= 0 => t,
            Some(t) => {
                return CorruptLogSnafu {
                    msg: format!("requested version {t} does not exist (latest is {latest})"),
                }
                .fail();
            }
        };

        let mut state = ReplayState::default();
        let mut replay_from = 0;

        if let Some(checkpoint_version) = Self::newest_checkpoint_at_most(store, target).await? {
            match checkpoint::read_checkpoint(store.location(), checkpoint_version).await {
                Ok(actions) => {
                    for action in actions {
                        state.apply(action);
                    }
                    replay_from = checkpoint_version + 1;
                }
                Err(e) => {
                    warn!(
                        "checkpoint {checkpoint_version} unreadable, replaying full log: {e}"
                    );
                    state = ReplayState::default();
                }
            }
        }

        for version in replay_from..=target {
            // `read_commit_actions` decodes the whole file before returning,
            // so a truncated commit fails replay instead of applying halfway.
            let actions = store.read_commit_actions(version).await?;
            for action in actions {
                state.apply(action);
            }
        }

        state.seal(target)
    }

    async fn newest_checkpoint_at_most(
        store: &LogStore,
        target: Version,
    ) -> Result<Option<Version>, CommitError> {
        if let Some(pointer) = checkpoint::read_last_checkpoint(store.location()).await {
            if pointer.version <= target {
                return Ok(Some(pointer.version));
            }
        }

        let versions = store.list_checkpoint_versions().await?;
        Ok(versions.into_iter().filter(|v| *v <= target).max())
    }

    /// Number of live data files.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Total size in bytes of the live data files.
    pub fn size_in_bytes(&self) -> i64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// The table schema, parsed from `Metadata.schemaString`.
    pub fn schema(&self) -> Result<StructType, SchemaError> {
        StructType::from_json(&self.metadata.schema_string)
    }

    /// The table's partition columns.
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Typed table configuration. Unknown or invalid properties degrade to
    /// defaults here; the strict check runs when properties are *set*.
    pub fn config(&self) -> TableConfig {
        match TableConfig::from_configuration(&self.metadata.configuration) {
            Ok(config) => config,
            Err(e) => {
                warn!("ignoring unusable table configuration: {e}");
                TableConfig::default()
            }
        }
    }

    /// The watermark version for an application, if any.
    pub fn txn_version(&self, app_id: &str) -> Option<i64> {
        self.app_transactions.get(app_id).map(|t| t.version)
    }

    /// Paths of tombstones past the retention horizon at `now`.
    pub fn expired_tombstones(&self, now: DateTime<Utc>, retention: Duration) -> Vec<&str> {
        let cutoff = now.timestamp_millis() - retention.as_millis() as i64;
        self.tombstones
            .values()
            .filter(|r| r.deletion_timestamp.unwrap_or(0) < cutoff)
            .map(|r| r.path.as_str())
            .collect()
    }

    /// The actions a checkpoint of this snapshot must contain.
    ///
    /// Tombstones past the retention horizon are left out — this is the
    /// only place tombstone GC happens.
    pub fn checkpoint_actions(&self, now: DateTime<Utc>) -> Vec<Action> {
        let retention = self.config().log_retention;
        let cutoff = now.timestamp_millis() - retention.as_millis() as i64;

        let mut actions = Vec::with_capacity(
            2 + self.app_transactions.len() + self.files.len() + self.tombstones.len(),
        );
        actions.push(Action::Protocol(self.protocol));
        actions.push(Action::Metadata(self.metadata.clone()));

        let mut txns: Vec<&Txn> = self.app_transactions.values().collect();
        txns.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        actions.extend(txns.into_iter().cloned().map(Action::Txn));

        let mut files: Vec<&AddFile> = self.files.values().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        actions.extend(files.into_iter().cloned().map(Action::Add));

        let mut tombstones: Vec<&RemoveFile> = self
            .tombstones
            .values()
            .filter(|r| r.deletion_timestamp.unwrap_or(0) >= cutoff)
            .collect();
        tombstones.sort_by(|a, b| a.path.cmp(&b.path));
        actions.extend(tombstones.into_iter().cloned().map(Action::Remove));

        actions
    }

    /// Write a checkpoint of this snapshot and advance `_last_checkpoint`.
    pub async fn write_checkpoint(&self, store: &LogStore) -> Result<LastCheckpoint, CommitError> {
        let actions = self.checkpoint_actions(Utc::now());
        checkpoint::write_checkpoint(store.location(), self.version, &actions)
            .await
            .context(CheckpointSnafu)
    }
}
