//! The decoded data model of a code-intelligence bundle.
//!
//! A bundle stores two kinds of opaque blobs: per-path document blobs
//! ([`DocumentData`]) and sharded result chunk blobs ([`ResultChunkData`]).
//! The types here mirror the producer's wire shapes (camelCase JSON) and
//! carry the size estimates that drive cache accounting.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use blob_cache::Weigh;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashMap, fmt, mem};

/// An opaque identifier from the original graph.
///
/// Identifiers are compared and hashed as strings; the only arithmetic ever
/// applied to one is the producer's shard hash, which the query layer owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// View the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Estimated heap footprint in bytes.
    pub fn size(&self) -> usize {
        mem::size_of::<Self>() + self.0.len()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Id {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A zero-based line/character pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    /// Zero-based line number.
    pub line: u32,
    /// Zero-based character offset within the line.
    pub character: u32,
}

/// A half-open region of a document: the start position is contained, the
/// end position is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// First contained position.
    pub start: Position,
    /// First position past the region.
    pub end: Position,
}

impl Range {
    /// Build a range from its four coordinates.
    pub fn new(start_line: u32, start_character: u32, end_line: u32, end_character: u32) -> Self {
        Self {
            start: Position {
                line: start_line,
                character: start_character,
            },
            end: Position {
                line: end_line,
                character: end_character,
            },
        }
    }
}

/// A range qualified by the path of the document containing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Repo-relative forward-slash path.
    pub path: String,
    /// Region within that document.
    pub range: Range,
}

/// The values of a bundle's single `meta` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMeta {
    /// Version of the original index format.
    pub lsif_version: String,
    /// Version of the worker that processed the bundle.
    pub sourcegraph_version: String,
    /// Number of rows in the result chunks table. Always positive.
    pub num_result_chunks: usize,
}

/// A single range of a decoded document together with the result identifiers
/// hanging off it. Any of the result identifiers may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeData {
    /// Zero-based starting line.
    pub start_line: u32,
    /// Zero-based starting character.
    pub start_character: u32,
    /// Zero-based ending line (exclusive together with the character).
    pub end_line: u32,
    /// Zero-based ending character (exclusive).
    pub end_character: u32,
    /// Key into a result chunk's result map for the definitions of the
    /// symbol at this range.
    #[serde(default, deserialize_with = "absent_if_empty")]
    pub definition_result_id: Option<Id>,
    /// Key into a result chunk's result map for the references of the
    /// symbol at this range.
    #[serde(default, deserialize_with = "absent_if_empty")]
    pub reference_result_id: Option<Id>,
    /// Key into the owning document's hover map.
    #[serde(default, deserialize_with = "absent_if_empty")]
    pub hover_result_id: Option<Id>,
    /// Keys into the owning document's moniker map, in attachment order.
    #[serde(default)]
    pub moniker_ids: Vec<Id>,
}

impl RangeData {
    /// Whether the half-open range contains the given position under
    /// line-then-character comparison.
    pub fn contains(&self, line: u32, character: u32) -> bool {
        (self.start_line, self.start_character) <= (line, character)
            && (line, character) < (self.end_line, self.end_character)
    }

    /// The coordinates of this range as a [`Range`].
    pub fn extent(&self) -> Range {
        Range::new(
            self.start_line,
            self.start_character,
            self.end_line,
            self.end_character,
        )
    }

    fn size(&self) -> usize {
        mem::size_of::<Self>()
            + self
                .moniker_ids
                .iter()
                .map(|id| id.0.len())
                .sum::<usize>()
    }
}

/// A cross-repository symbol identifier attached to a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonikerData {
    /// `import`, `export`, or `local`.
    pub kind: String,
    /// The identifier scheme, e.g. `gomod`.
    pub scheme: String,
    /// The symbol identifier within the scheme.
    pub identifier: String,
    /// Key into the owning document's package information map, if the
    /// moniker belongs to a package.
    #[serde(default, deserialize_with = "absent_if_empty")]
    pub package_information_id: Option<Id>,
}

impl MonikerData {
    fn size(&self) -> usize {
        mem::size_of::<Self>() + self.kind.len() + self.scheme.len() + self.identifier.len()
    }
}

/// The name and version of the package a moniker belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInformationData {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
}

impl PackageInformationData {
    fn size(&self) -> usize {
        mem::size_of::<Self>() + self.name.len() + self.version.len()
    }
}

/// The decoded form of a per-path document blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentData {
    /// Every range of the document, keyed by range identifier. Ranges may
    /// overlap and nest.
    #[serde(default)]
    pub ranges: HashMap<Id, RangeData>,
    /// Rendered hover markdown keyed by hover result identifier.
    #[serde(default)]
    pub hover_results: HashMap<Id, String>,
    /// Monikers keyed by moniker identifier.
    #[serde(default)]
    pub monikers: HashMap<Id, MonikerData>,
    /// Package information keyed by package information identifier.
    #[serde(default)]
    pub package_information: HashMap<Id, PackageInformationData>,
}

impl DocumentData {
    /// Estimated heap footprint of the decoded document in bytes.
    pub fn size(&self) -> usize {
        let ranges: usize = self
            .ranges
            .iter()
            .map(|(id, r)| id.size() + r.size())
            .sum();
        let hovers: usize = self
            .hover_results
            .iter()
            .map(|(id, text)| id.size() + text.len())
            .sum();
        let monikers: usize = self
            .monikers
            .iter()
            .map(|(id, m)| id.size() + m.size())
            .sum();
        let packages: usize = self
            .package_information
            .iter()
            .map(|(id, p)| id.size() + p.size())
            .sum();

        ranges + hovers + monikers + packages
    }
}

impl Weigh for DocumentData {
    fn weight(&self) -> usize {
        self.size()
    }
}

/// A `(document, range)` pair inside a result chunk, both by identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentIdRangeId {
    /// Key into the chunk's document path map.
    pub document_id: Id,
    /// Key into the named document's range map.
    pub range_id: Id,
}

/// The decoded form of a result chunk blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultChunkData {
    /// Document paths keyed by document identifier, covering every document
    /// mentioned by the chunk's results.
    #[serde(default)]
    pub document_paths: HashMap<Id, String>,
    /// Resolved pair lists keyed by definition or reference result
    /// identifier.
    #[serde(default)]
    pub document_id_range_ids: HashMap<Id, Vec<DocumentIdRangeId>>,
}

impl ResultChunkData {
    /// Estimated heap footprint of the decoded chunk in bytes.
    pub fn size(&self) -> usize {
        let paths: usize = self
            .document_paths
            .iter()
            .map(|(id, path)| id.size() + path.len())
            .sum();
        let results: usize = self
            .document_id_range_ids
            .iter()
            .map(|(id, pairs)| {
                id.size()
                    + pairs
                        .iter()
                        .map(|pair| pair.document_id.size() + pair.range_id.size())
                        .sum::<usize>()
            })
            .sum();

        paths + results
    }
}

impl Weigh for ResultChunkData {
    fn weight(&self) -> usize {
        self.size()
    }
}

/// Deserialize an optional identifier, treating both a missing field and an
/// empty string as absent. The producer writes `""` for "no result".
fn absent_if_empty<'de, D>(deserializer: D) -> Result<Option<Id>, D::Error>
where
    D: Deserializer<'de>,
{
    let id = Option::<Id>::deserialize(deserializer)?;
    Ok(id.filter(|id| !id.0.is_empty()))
}
