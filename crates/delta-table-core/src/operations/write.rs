//! Append write path.

use std::collections::HashMap;

use snafu::prelude::*;

use crate::operations::{DmlError, DmlRuntimeSnafu, DmlSchemaSnafu, DmlTxnSnafu};
use crate::runtime::local::stream_from;
use crate::runtime::{QueryRuntime, Row};
use crate::transaction::{DeltaOperation, OptimisticTransaction};
use crate::transaction_log::actions::Action;
use crate::transaction_log::log_store::{LogStore, Version};
use crate::transaction_log::Snapshot;

/// Append `rows` as new data files in a single blind-append commit.
pub(crate) async fn append_rows(
    store: &LogStore,
    snapshot: Snapshot,
    runtime: &dyn QueryRuntime,
    rows: Vec<Row>,
) -> Result<Version, DmlError> {
    let schema = snapshot.schema().context(DmlSchemaSnafu)?;
    let partition_columns = snapshot.partition_columns().to_vec();
    let num_rows = rows.len();

    let added = runtime
        .write(
            store.location(),
            stream_from(rows),
            &schema,
            &partition_columns,
        )
        .context(DmlRuntimeSnafu)?;

    let metrics = HashMap::from([
        ("numFiles".to_string(), added.len().to_string()),
        (
            "numOutputBytes".to_string(),
            added.iter().map(|a| a.size).sum::<i64>().to_string(),
        ),
        ("numOutputRows".to_string(), num_rows.to_string()),
    ]);

    let txn = OptimisticTransaction::new(store.clone(), snapshot);
    txn.commit_with_metrics(
        added.into_iter().map(Action::Add).collect(),
        DeltaOperation::Write {
            mode: "Append".to_string(),
            partition_by: None,
        },
        metrics,
    )
    .await
    .context(DmlTxnSnafu)
}
