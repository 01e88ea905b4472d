//! Recognized table properties.
//!
//! Properties live in `Metadata.configuration` as strings and are parsed
//! into a typed [`TableConfig`] when a snapshot is loaded. Unrecognized keys
//! inside the reserved prefixes (`delta.`, `merge.`, `autoMerge.`) are an
//! error; anything else is treated as a user property and passed through
//! untouched.
//!
//! Durations use the SQL interval syntax the original format uses
//! (`interval 30 days`); bare integers are accepted as milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use snafu::prelude::*;

/// How long committed log entries (and tombstones) are retained before GC.
pub const LOG_RETENTION_DURATION: &str = "delta.logRetentionDuration";
/// Number of commits between automatic checkpoints.
pub const CHECKPOINT_INTERVAL: &str = "delta.checkpointInterval";
/// When `true`, the writer rejects any data-changing `RemoveFile`.
pub const APPEND_ONLY: &str = "delta.appendOnly";
/// Width of the randomized key prefix on the write path (> 0 enables it).
pub const RANDOM_PREFIX_LENGTH: &str = "delta.randomPrefixLength";
/// Enables stats-based data skipping.
pub const STATS_SKIPPING: &str = "delta.stats.skipping";
/// Shuffle output by partition columns before writing MERGE results.
pub const MERGE_REPARTITION_BEFORE_WRITE: &str = "merge.repartitionBeforeWrite.enabled";
/// Enables the insert-only MERGE fast path.
pub const MERGE_INSERT_ONLY: &str = "merge.insertOnly.enabled";
/// Uses a RIGHT OUTER join when a MERGE has no not-matched clauses.
pub const MERGE_MATCHED_ONLY: &str = "merge.matchedOnly.enabled";
/// Enables schema evolution in MERGE.
pub const AUTO_MERGE_SCHEMA: &str = "autoMerge.schema";

/// Prefix for CHECK constraint properties (each requires writer version 3).
pub const CONSTRAINT_PREFIX: &str = "delta.constraints.";

/// Errors raised while parsing table properties.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The key sits in a reserved prefix but is not a recognized property.
    #[snafu(display("Unknown table property: {key}"))]
    UnknownTableProperty {
        /// The unrecognized key.
        key: String,
    },

    /// The value does not parse for the property's type.
    #[snafu(display("Invalid value for table property {key}: {value:?} ({reason})"))]
    InvalidPropertyValue {
        /// The property key.
        key: String,
        /// The raw value supplied.
        value: String,
        /// Why it does not parse.
        reason: String,
    },
}

/// Typed view over a table's configuration map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Retention horizon for log entries and tombstones.
    pub log_retention: Duration,
    /// Commits between automatic checkpoints.
    pub checkpoint_interval: u32,
    /// Whether the table rejects data-changing removes.
    pub append_only: bool,
    /// Randomized write-path key prefix width, when enabled.
    pub random_prefix_length: Option<u32>,
    /// Whether stats-based skipping is enabled.
    pub stats_skipping: bool,
    /// Whether MERGE repartitions by partition columns before writing.
    pub merge_repartition_before_write: bool,
    /// Whether the insert-only MERGE fast path is enabled.
    pub merge_insert_only: bool,
    /// Whether matched-only MERGE uses a RIGHT OUTER join.
    pub merge_matched_only: bool,
    /// Whether MERGE evolves the target schema.
    pub auto_merge_schema: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            log_retention: Duration::from_secs(30 * 24 * 60 * 60),
            checkpoint_interval: 10,
            append_only: false,
            random_prefix_length: None,
            stats_skipping: true,
            merge_repartition_before_write: false,
            merge_insert_only: true,
            merge_matched_only: true,
            auto_merge_schema: false,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => InvalidPropertyValueSnafu {
            key,
            value,
            reason: "expected true or false",
        }
        .fail(),
    }
}

fn parse_positive_int(key: &str, value: &str) -> Result<u32, ConfigError> {
    let parsed: u32 = value.trim().parse().map_err(|_| {
        InvalidPropertyValueSnafu {
            key,
            value,
            reason: "expected a positive integer",
        }
        .build()
    })?;
    ensure!(
        parsed > 0,
        InvalidPropertyValueSnafu {
            key,
            value,
            reason: "must be greater than zero",
        }
    );
    Ok(parsed)
}

/// Parse `interval <n> <unit>` (or bare milliseconds) into a duration.
fn parse_interval(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();

    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }

    let mut parts = trimmed.split_whitespace();
    let (head, count, unit) = (parts.next(), parts.next(), parts.next());
    let invalid = |reason: &str| {
        InvalidPropertyValueSnafu {
            key,
            value,
            reason,
        }
        .build()
    };

    if !head.is_some_and(|h| h.eq_ignore_ascii_case("interval")) || parts.next().is_some() {
        return Err(invalid("expected `interval <count> <unit>` or milliseconds"));
    }
    let count: u64 = count
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| invalid("interval count must be a non-negative integer"))?;
    let unit_secs = match unit.map(|u| u.trim_end_matches('s').to_ascii_lowercase()) {
        Some(u) if u == "second" => 1,
        Some(u) if u == "minute" => 60,
        Some(u) if u == "hour" => 3600,
        Some(u) if u == "day" => 86_400,
        Some(u) if u == "week" => 604_800,
        _ => return Err(invalid("unknown interval unit")),
    };

    Ok(Duration::from_secs(count * unit_secs))
}

impl TableConfig {
    /// Parse a configuration map into a typed config.
    ///
    /// Keys outside the reserved prefixes are user properties and ignored;
    /// CHECK constraint entries (`delta.constraints.*`) are recognized but
    /// carried opaquely (the protocol gate inspects their presence).
    pub fn from_configuration(
        configuration: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, value) in configuration {
            match key.as_str() {
                LOG_RETENTION_DURATION => config.log_retention = parse_interval(key, value)?,
                CHECKPOINT_INTERVAL => config.checkpoint_interval = parse_positive_int(key, value)?,
                APPEND_ONLY => config.append_only = parse_bool(key, value)?,
                RANDOM_PREFIX_LENGTH => {
                    config.random_prefix_length = Some(parse_positive_int(key, value)?)
                }
                STATS_SKIPPING => config.stats_skipping = parse_bool(key, value)?,
                MERGE_REPARTITION_BEFORE_WRITE => {
                    config.merge_repartition_before_write = parse_bool(key, value)?
                }
                MERGE_INSERT_ONLY => config.merge_insert_only = parse_bool(key, value)?,
                MERGE_MATCHED_ONLY => config.merge_matched_only = parse_bool(key, value)?,
                AUTO_MERGE_SCHEMA => config.auto_merge_schema = parse_bool(key, value)?,
                _ if key.starts_with(CONSTRAINT_PREFIX) => {}
                _ if key.starts_with("delta.")
                    || key.starts_with("merge.")
                    || key.starts_with("autoMerge.") =>
                {
                    return UnknownTablePropertySnafu { key }.fail();
                }
                _ => {}
            }
        }

        Ok(config)
    }
}
