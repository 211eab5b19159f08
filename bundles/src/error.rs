use snafu::Snafu;
use std::sync::Arc;

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures answering queries against a bundle.
///
/// The error is `Clone` (non-cloneable sources are held behind `Arc`) so
/// that a single failed blob fill can be broadcast to every caller
/// coalesced on it.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum Error {
    /// A reference inside the bundle graph failed to resolve in the table
    /// that must contain it. `name` classifies the missing object.
    #[snafu(display("malformed bundle {}: unknown {} {}", filename, name, key))]
    MalformedBundle {
        filename: String,
        name: &'static str,
        key: String,
    },

    #[snafu(display("storage error: {}", source))]
    Storage {
        #[snafu(source(from(rusqlite::Error, Arc::new)))]
        source: Arc<rusqlite::Error>,
    },

    #[snafu(display("error decompressing blob: {}", source))]
    DecompressBlob {
        #[snafu(source(from(std::io::Error, Arc::new)))]
        source: Arc<std::io::Error>,
    },

    #[snafu(display("error decoding blob: {}", source))]
    DecodeBlob {
        #[snafu(source(from(serde_json::Error, Arc::new)))]
        source: Arc<serde_json::Error>,
    },

    #[snafu(display("no rows in meta table of {}", filename))]
    MissingMetaRow { filename: String },

    #[snafu(display("blocking task failed: {}", source))]
    TaskJoin {
        #[snafu(source(from(tokio::task::JoinError, Arc::new)))]
        source: Arc<tokio::task::JoinError>,
    },
}

impl Error {
    /// Whether this is the storage layer reporting an absent row. Absent
    /// rows mean "not indexed", which most queries surface as an empty
    /// result rather than an error.
    pub fn is_row_not_found(&self) -> bool {
        matches!(
            self,
            Self::Storage { source } if matches!(**source, rusqlite::Error::QueryReturnedNoRows)
        )
    }
}
