//! DML verbs: append, DELETE, UPDATE.
//!
//! Each verb follows the same pipeline: refresh the snapshot, start a
//! transaction, narrow candidate files through the index, hand row work to
//! the query runtime, and commit removes/adds under conflict detection with
//! operation metrics attached. MERGE, the heavyweight verb, lives in its
//! own module.

pub mod delete;
pub mod update;
pub mod write;

use snafu::prelude::*;

use crate::runtime::RuntimeError;
use crate::schema::SchemaError;
use crate::transaction::TransactionError;

/// Errors raised by the DML verbs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DmlError {
    /// Commit failed (including classified conflicts).
    #[snafu(display("Transaction error: {source}"))]
    DmlTxn {
        /// Underlying transaction error.
        #[snafu(source)]
        source: TransactionError,
    },

    /// The query runtime failed while scanning or writing rows.
    #[snafu(display("Query runtime error: {source}"))]
    DmlRuntime {
        /// Underlying runtime error.
        #[snafu(source)]
        source: RuntimeError,
    },

    /// Schema lookup or validation failed.
    #[snafu(display("Schema error: {source}"))]
    DmlSchema {
        /// Underlying schema error.
        #[snafu(source)]
        source: SchemaError,
    },

    /// A partition-scoped operation was given a non-partition predicate.
    #[snafu(display("Predicate references non-partition columns: {predicate}"))]
    NonPartitionPredicate {
        /// The offending predicate, rendered.
        predicate: String,
    },

    /// UPDATE was invoked without assignments.
    #[snafu(display("UPDATE requires at least one SET assignment"))]
    EmptyAssignments,
}
