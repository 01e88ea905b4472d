//! Reader/writer protocol gate.
//!
//! Every snapshot carries a [`Protocol`] action naming the minimum reader
//! and writer versions required to access the table. This library supports
//! reader version 1 and writer version 3; anything newer must fail fast,
//! before any data is interpreted. Features raise the floor: column
//! invariants and append-only enforcement need writer 2, CHECK constraints
//! need writer 3. Downgrades are rejected so a table can never silently
//! lose a guarantee an earlier writer established.

use std::collections::HashMap;

use snafu::prelude::*;

use crate::config::CONSTRAINT_PREFIX;
use crate::schema::StructType;
use crate::transaction_log::actions::Protocol;

/// Highest reader protocol version this library implements.
pub const SUPPORTED_READER_VERSION: i32 = 1;
/// Highest writer protocol version this library implements.
pub const SUPPORTED_WRITER_VERSION: i32 = 3;

/// Protocol version required before any feature raises it.
pub const BASE_PROTOCOL: Protocol = Protocol {
    min_reader_version: 1,
    min_writer_version: 2,
};

/// Errors raised by the protocol gate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    /// The table requires a newer reader than this library implements.
    #[snafu(display(
        "Table requires reader version {required}, but this client supports up to {supported}"
    ))]
    UnsupportedReaderVersion {
        /// Version the table demands.
        required: i32,
        /// Version this library implements.
        supported: i32,
    },

    /// The table requires a newer writer than this library implements.
    #[snafu(display(
        "Table requires writer version {required}, but this client supports up to {supported}"
    ))]
    UnsupportedWriterVersion {
        /// Version the table demands.
        required: i32,
        /// Version this library implements.
        supported: i32,
    },

    /// A commit attempted to lower a protocol version.
    #[snafu(display(
        "Protocol downgrade rejected: ({}, {}) -> ({}, {})",
        current.min_reader_version, current.min_writer_version,
        proposed.min_reader_version, proposed.min_writer_version
    ))]
    ProtocolDowngradeRejected {
        /// The table's current protocol.
        current: Protocol,
        /// The proposed protocol.
        proposed: Protocol,
    },
}

/// Fail unless this library may read a table with the given protocol.
pub fn ensure_read_supported(protocol: &Protocol) -> Result<(), ProtocolError> {
    ensure!(
        protocol.min_reader_version <= SUPPORTED_READER_VERSION,
        UnsupportedReaderVersionSnafu {
            required: protocol.min_reader_version,
            supported: SUPPORTED_READER_VERSION,
        }
    );
    Ok(())
}

/// Fail unless this library may write to a table with the given protocol.
pub fn ensure_write_supported(protocol: &Protocol) -> Result<(), ProtocolError> {
    ensure_read_supported(protocol)?;
    ensure!(
        protocol.min_writer_version <= SUPPORTED_WRITER_VERSION,
        UnsupportedWriterVersionSnafu {
            required: protocol.min_writer_version,
            supported: SUPPORTED_WRITER_VERSION,
        }
    );
    Ok(())
}

/// Reject any lowering of either protocol version.
pub fn ensure_no_downgrade(current: &Protocol, proposed: &Protocol) -> Result<(), ProtocolError> {
    ensure!(
        proposed.min_reader_version >= current.min_reader_version
            && proposed.min_writer_version >= current.min_writer_version,
        ProtocolDowngradeRejectedSnafu {
            current: *current,
            proposed: *proposed,
        }
    );
    Ok(())
}

/// Compute the protocol floor demanded by a table's features.
///
/// Column invariants and `delta.appendOnly` require writer 2; CHECK
/// constraints require writer 3.
pub fn required_by_features(
    schema: &StructType,
    configuration: &HashMap<String, String>,
) -> Protocol {
    let mut required = BASE_PROTOCOL;

    let append_only = configuration
        .get(crate::config::APPEND_ONLY)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if append_only || schema.has_invariants() {
        required.min_writer_version = required.min_writer_version.max(2);
    }
    if configuration.keys().any(|k| k.starts_with(CONSTRAINT_PREFIX)) {
        required.min_writer_version = required.min_writer_version.max(3);
    }

    required
}

/// The protocol to commit on creation or alteration: the feature floor,
/// never below what the table already has.
pub fn effective_protocol(
    existing: Option<&Protocol>,
    schema: &StructType,
    configuration: &HashMap<String, String>,
) -> Protocol {
    let required = required_by_features(schema, configuration);
    match existing {
        None => required,
        Some(current) => Protocol {
            min_reader_version: current.min_reader_version.max(required.min_reader_version),
            min_writer_version: current.min_writer_version.max(required.min_writer_version),
        },
    }
}
