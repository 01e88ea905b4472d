//! Facade crate for the transactional table format.
//!
//! Downstream crates depend on this instead of the individual layers; it
//! re-exports the core API and provides a [`prelude`] with the handful of
//! types almost every caller needs.

#![warn(missing_docs)]

pub use delta_table_core::*;

pub mod prelude;
