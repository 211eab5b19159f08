//! Read-only queries against per-commit code-intelligence bundles.
//!
//! A bundle is a self-contained SQLite file describing one indexed snapshot
//! of a repository. [`Database`] answers symbol-level queries (definitions,
//! references, hover text, monikers, package information) against a single
//! bundle; [`Registry`] maps dump identifiers to open databases and keeps
//! the shared decoded-blob caches consistent when bundles go away.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod blob;
mod database;
mod error;
mod ranges;
mod registry;

#[cfg(test)]
mod test_util;

pub use database::{Database, DocumentDataCache, MonikerTable, ResultChunkDataCache};
pub use error::{Error, Result};
pub use registry::Registry;
