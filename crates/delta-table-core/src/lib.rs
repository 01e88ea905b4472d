//! Core engine for a transactional, log-structured table format.
//!
//! This crate layers ACID semantics, schema evolution, time travel, and an
//! incremental streaming source on top of immutable columnar data files.
//! It never stores rows itself: an ordered log of JSON-encoded *actions*
//! under `_delta_log/` records which files belong to each table version.
//! Readers reconstruct a [`transaction_log::Snapshot`] by replaying the
//! log; writers append the next version with optimistic concurrency.
//!
//! Responsibilities (high level):
//! - The action model, line codec, versioned log store, checkpoints, and
//!   snapshot replay ([`transaction_log`]).
//! - Reader/writer protocol gating ([`transaction_log::protocol`]).
//! - Optimistic transactions with read-set tracking, classified conflict
//!   detection, and bounded retry ([`transaction`]).
//! - Partition pruning and stats-based data skipping ([`index`]).
//! - The DML verbs: append / DELETE / UPDATE ([`operations`]) and the
//!   two-phase MERGE engine ([`merge`]).
//! - An offset-based incremental streaming source ([`streaming`]).
//! - Schema modeling, compatibility, and evolution rules ([`schema`]).
//!
//! Row-level execution is *not* part of the core: scanning, joining, and
//! writing data files go through the [`runtime::QueryRuntime`] capability.
//! A single-process [`runtime::LocalRuntime`] is bundled so the crate is
//! usable and testable on its own; production deployments plug in a real
//! engine.

#![warn(missing_docs)]

pub mod config;
pub mod expr;
pub mod index;
pub mod merge;
pub mod operations;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod streaming;
pub mod table;
pub mod transaction;
pub mod transaction_log;

pub use expr::{Expr, Scalar};
pub use storage::TableLocation;
pub use table::{is_delta_table, DeltaLog, DeltaTable, TableError, TableRegistry};
pub use transaction_log::{Action, Snapshot, Version};
