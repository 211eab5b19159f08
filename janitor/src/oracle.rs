//! The upstream authority on dump state.

use async_trait::async_trait;
use std::collections::HashMap;

/// Errors produced by an oracle implementation.
pub type OracleError = Box<dyn std::error::Error + Send + Sync>;

/// The upstream service owning dump records, as far as the janitor is
/// concerned: it knows which dumps are alive and which completed dump is
/// next in line for size-driven eviction.
///
/// Production implementations call over the network; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait DumpOracle: std::fmt::Debug + Send + Sync {
    /// Return the current state (`completed`, `queued`, `processing`,
    /// `errored`, …) for every **known** identifier in `ids`, omitting
    /// identifiers it has no record of. Any returned state, including the
    /// terminal error states, means the dump is alive; omission means the
    /// bundle file has no owner left.
    async fn states(&self, ids: &[i64]) -> Result<HashMap<i64, String>, OracleError>;

    /// The identifier of the least-recently-queried completed dump, or
    /// `None` when nothing further may be pruned.
    async fn next_prunable(&self) -> Result<Option<i64>, OracleError>;
}
