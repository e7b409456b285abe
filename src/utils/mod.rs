//!
//! Utility module for the reconciliation engine.
//!
//! Re-exports the percentage helpers shared by progress and deduplication statistics.
/// Percentage computation and formatting
pub mod index;

pub use index::{format_percentage, percentage};
