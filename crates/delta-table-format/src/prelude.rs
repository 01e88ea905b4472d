//! Convenience re-exports.
//!
//! ```ignore
//! use delta_table_format::prelude::*;
//! ```

pub use delta_table_core::expr::{Expr, Scalar};
pub use delta_table_core::merge::{MergeBuilder, MergeError, MergeMetrics};
pub use delta_table_core::runtime::{LocalRuntime, QueryRuntime, Row, RowSchema};
pub use delta_table_core::schema::{DataType, PrimitiveType, StructField, StructType};
pub use delta_table_core::storage::TableLocation;
pub use delta_table_core::streaming::{
    AdmissionLimits, StartingPosition, StreamOffset, StreamOptions, StreamingSource,
};
pub use delta_table_core::table::{DeltaLog, DeltaTable, TableError, TableRegistry};
pub use delta_table_core::transaction::{DeltaOperation, OptimisticTransaction};
pub use delta_table_core::transaction_log::{Action, LogStore, Snapshot, Version};
