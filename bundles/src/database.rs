//! Queries against a single bundle, see [`Database`].

use crate::{
    blob::{decode_document_data, decode_result_chunk_data},
    error::{MalformedBundleSnafu, MissingMetaRowSnafu, StorageSnafu, TaskJoinSnafu},
    ranges::find_ranges,
    Error, Result,
};
use blob_cache::SharedCache;
use bundle_types::{
    BundleMeta, DocumentData, Id, Location, MonikerData, PackageInformationData, Range, RangeData,
    ResultChunkData,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use snafu::{OptionExt, ResultExt};
use std::{path::Path, sync::Arc};
use tokio::task;

/// Shared cache of decoded document blobs, keyed `"<filename>::<path>"`.
pub type DocumentDataCache = SharedCache<DocumentData, Error>;

/// Shared cache of decoded result chunk blobs, keyed `"<filename>::<shard>"`.
pub type ResultChunkDataCache = SharedCache<ResultChunkData, Error>;

/// Which flat moniker index to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonikerTable {
    /// The `definitions` table.
    Definitions,
    /// The `references` table.
    References,
}

impl MonikerTable {
    fn sql_name(self) -> &'static str {
        match self {
            Self::Definitions => "definitions",
            Self::References => "references",
        }
    }
}

/// A range qualified by the path of the document containing it, produced by
/// resolving a definition or reference result.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentPathRangeId {
    path: String,
    range_id: Id,
}

/// Read-only access to a single processed bundle.
///
/// All queries share two process-wide caches of decoded blobs; the database
/// namespaces its cache keys with its own filename so entries of different
/// bundles can never collide. The underlying SQLite handle is released when
/// the last clone of the owning `Arc` drops.
#[derive(Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    filename: String,
    num_result_chunks: usize,
    document_data_cache: Arc<DocumentDataCache>,
    result_chunk_data_cache: Arc<ResultChunkDataCache>,
}

impl Database {
    /// Open the bundle file at `path` read-only and capture its meta row.
    /// A bundle without a meta row is unusable and fails here rather than on
    /// first query.
    pub async fn open(
        path: impl AsRef<Path>,
        document_data_cache: Arc<DocumentDataCache>,
        result_chunk_data_cache: Arc<ResultChunkDataCache>,
    ) -> Result<Self> {
        let filename = path.as_ref().to_string_lossy().into_owned();

        let filename_captured = filename.clone();
        let (conn, meta) = task::spawn_blocking(move || -> Result<(Connection, BundleMeta)> {
            let conn = Connection::open_with_flags(
                &filename_captured,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .context(StorageSnafu)?;
            let meta = read_meta(&conn, &filename_captured)?;
            Ok((conn, meta))
        })
        .await
        .context(TaskJoinSnafu)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            filename,
            num_result_chunks: meta.num_result_chunks,
            document_data_cache,
            result_chunk_data_cache,
        })
    }

    /// The filename this database was opened from. Cache keys of this bundle
    /// all start with `"<filename>::"`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Whether the bundle indexed a document at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.document_data(path).await?.is_some())
    }

    /// The locations defining the symbol at the given position.
    ///
    /// Scanning the enclosing ranges outside-in, the first range carrying a
    /// definition result decides; later (smaller) ranges are not consulted.
    pub async fn definitions(&self, path: &str, line: u32, character: u32) -> Result<Vec<Location>> {
        let ranges = match self.ranges_by_position(path, line, character).await? {
            Some((_, ranges)) => ranges,
            None => return Ok(Vec::new()),
        };

        for r in &ranges {
            let definition_result_id = match &r.definition_result_id {
                Some(id) => id,
                None => continue,
            };

            let pairs = self.result_by_id(definition_result_id).await?;
            return self.locations_from_pairs(pairs).await;
        }

        Ok(Vec::new())
    }

    /// The locations referencing the symbol at the given position,
    /// accumulated across every enclosing range that carries a reference
    /// result, outside-in.
    pub async fn references(&self, path: &str, line: u32, character: u32) -> Result<Vec<Location>> {
        let ranges = match self.ranges_by_position(path, line, character).await? {
            Some((_, ranges)) => ranges,
            None => return Ok(Vec::new()),
        };

        let mut all_locations = Vec::new();
        for r in &ranges {
            let reference_result_id = match &r.reference_result_id {
                Some(id) => id,
                None => continue,
            };

            let pairs = self.result_by_id(reference_result_id).await?;
            all_locations.extend(self.locations_from_pairs(pairs).await?);
        }

        Ok(all_locations)
    }

    /// The hover text of the symbol at the given position and the range it
    /// is attached to, or `None` when no enclosing range carries hover data.
    pub async fn hover(
        &self,
        path: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<(String, Range)>> {
        let (document, ranges) = match self.ranges_by_position(path, line, character).await? {
            Some(v) => v,
            None => return Ok(None),
        };

        for r in &ranges {
            let hover_result_id = match &r.hover_result_id {
                Some(id) => id,
                None => continue,
            };

            let text =
                document
                    .hover_results
                    .get(hover_result_id)
                    .context(MalformedBundleSnafu {
                        filename: self.filename.as_str(),
                        name: "hoverResult",
                        key: hover_result_id.as_str(),
                    })?;

            return Ok(Some((text.clone(), r.extent())));
        }

        Ok(None)
    }

    /// All monikers attached to ranges containing the given position. Each
    /// inner batch belongs to one range, in the range's attachment order;
    /// batches are ordered outside-in, so monikers of enclosing ranges come
    /// before monikers of the ranges they enclose.
    pub async fn monikers_by_position(
        &self,
        path: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Vec<MonikerData>>> {
        let (document, ranges) = match self.ranges_by_position(path, line, character).await? {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };

        let mut batches = Vec::with_capacity(ranges.len());
        for r in &ranges {
            let mut batch = Vec::with_capacity(r.moniker_ids.len());
            for moniker_id in &r.moniker_ids {
                let moniker = document
                    .monikers
                    .get(moniker_id)
                    .context(MalformedBundleSnafu {
                        filename: self.filename.as_str(),
                        name: "moniker",
                        key: moniker_id.as_str(),
                    })?;
                batch.push(moniker.clone());
            }
            batches.push(batch);
        }

        Ok(batches)
    }

    /// The locations recorded in the flat moniker index for the given
    /// scheme and identifier, paginated by `skip`/`take`, along with the
    /// unpaginated total count.
    ///
    /// Row order is storage order: stable for a given bundle file but not
    /// otherwise specified, so callers should rely on it only to paginate.
    pub async fn moniker_results(
        &self,
        table: MonikerTable,
        scheme: &str,
        identifier: &str,
        skip: usize,
        take: usize,
    ) -> Result<(Vec<Location>, usize)> {
        let conn = Arc::clone(&self.conn);
        let scheme = scheme.to_string();
        let identifier = identifier.to_string();

        task::spawn_blocking(move || {
            let conn = conn.lock();

            let query = format!(
                "SELECT documentPath, startLine, startCharacter, endLine, endCharacter \
                 FROM \"{}\" WHERE scheme = ?1 AND identifier = ?2 LIMIT ?3 OFFSET ?4",
                table.sql_name()
            );
            let mut stmt = conn.prepare(&query).context(StorageSnafu)?;
            let locations = stmt
                .query_map(
                    params![scheme, identifier, take as i64, skip as i64],
                    |row| {
                        Ok(Location {
                            path: row.get(0)?,
                            range: Range::new(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                        })
                    },
                )
                .context(StorageSnafu)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context(StorageSnafu)?;

            let count_query = format!(
                "SELECT COUNT(1) FROM \"{}\" WHERE scheme = ?1 AND identifier = ?2",
                table.sql_name()
            );
            let total_count = conn
                .query_row(&count_query, params![scheme, identifier], |row| {
                    row.get::<_, i64>(0)
                })
                .context(StorageSnafu)?;

            Ok((locations, total_count as usize))
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Package information by identifier within the named document.
    ///
    /// A missing identifier yields `None`: unlike the result identifiers, a
    /// document legitimately may carry no package information for a moniker.
    pub async fn package_information(
        &self,
        path: &str,
        package_information_id: &Id,
    ) -> Result<Option<PackageInformationData>> {
        match self.document_data(path).await? {
            Some(document) => Ok(document
                .package_information
                .get(package_information_id)
                .cloned()),
            None => Ok(None),
        }
    }

    /// Fetch and decode the document blob for `path` through the shared
    /// cache. `None` means the path is not indexed by this bundle.
    async fn document_data(&self, path: &str) -> Result<Option<Arc<DocumentData>>> {
        let key = format!("{}::{}", self.filename, path);
        let conn = Arc::clone(&self.conn);
        let path = path.to_string();

        let result = self
            .document_data_cache
            .get_or_create(&key, move || async move {
                let raw = task::spawn_blocking(move || {
                    let conn = conn.lock();
                    conn.query_row(
                        "SELECT data FROM documents WHERE path = ?1",
                        params![path],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .context(StorageSnafu)
                })
                .await
                .context(TaskJoinSnafu)??;

                decode_document_data(&raw)
            })
            .await;

        match result {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.is_row_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch the document for `path` and the ranges containing the given
    /// position, outside-in.
    async fn ranges_by_position(
        &self,
        path: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<(Arc<DocumentData>, Vec<RangeData>)>> {
        match self.document_data(path).await? {
            Some(document) => {
                let ranges = find_ranges(&document.ranges, line, character);
                Ok(Some((document, ranges)))
            }
            None => Ok(None),
        }
    }

    /// Resolve a definition or reference result identifier into qualified
    /// `(path, range id)` pairs via its result chunk.
    async fn result_by_id(&self, id: &Id) -> Result<Vec<DocumentPathRangeId>> {
        let chunk = self.result_chunk(id).await?;

        let document_id_range_ids =
            chunk
                .document_id_range_ids
                .get(id)
                .context(MalformedBundleSnafu {
                    filename: self.filename.as_str(),
                    name: "result",
                    key: id.as_str(),
                })?;

        let mut pairs = Vec::with_capacity(document_id_range_ids.len());
        for document_id_range_id in document_id_range_ids {
            let path = chunk
                .document_paths
                .get(&document_id_range_id.document_id)
                .context(MalformedBundleSnafu {
                    filename: self.filename.as_str(),
                    name: "documentPath",
                    key: document_id_range_id.document_id.as_str(),
                })?;

            pairs.push(DocumentPathRangeId {
                path: path.clone(),
                range_id: document_id_range_id.range_id.clone(),
            });
        }

        Ok(pairs)
    }

    /// Fetch and decode the result chunk holding `id` through the shared
    /// cache. Only the shard the hash selects is consulted; an absent row
    /// there means the bundle is malformed, not that another shard might
    /// have it.
    async fn result_chunk(&self, id: &Id) -> Result<Arc<ResultChunkData>> {
        let shard = hash_key(id, self.num_result_chunks);
        let key = format!("{}::{}", self.filename, shard);
        let conn = Arc::clone(&self.conn);

        let result = self
            .result_chunk_data_cache
            .get_or_create(&key, move || async move {
                let raw = task::spawn_blocking(move || {
                    let conn = conn.lock();
                    conn.query_row(
                        "SELECT data FROM resultChunks WHERE id = ?1",
                        params![shard as i64],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .context(StorageSnafu)
                })
                .await
                .context(TaskJoinSnafu)??;

                decode_result_chunk_data(&raw)
            })
            .await;

        match result {
            Ok(chunk) => Ok(chunk),
            Err(e) if e.is_row_not_found() => MalformedBundleSnafu {
                filename: self.filename.as_str(),
                name: "result chunk",
                key: id.as_str(),
            }
            .fail(),
            Err(e) => Err(e),
        }
    }

    /// Convert qualified `(path, range id)` pairs into locations.
    ///
    /// Pairs are grouped by path before touching the document cache so each
    /// document is fetched and decoded at most once per conversion. Groups
    /// keep first-appearance order and pairs keep their order within a
    /// group.
    async fn locations_from_pairs(
        &self,
        pairs: Vec<DocumentPathRangeId>,
    ) -> Result<Vec<Location>> {
        let mut grouped: Vec<(String, Vec<Id>)> = Vec::new();
        for pair in pairs {
            match grouped.iter_mut().find(|(path, _)| *path == pair.path) {
                Some((_, range_ids)) => range_ids.push(pair.range_id),
                None => grouped.push((pair.path, vec![pair.range_id])),
            }
        }

        let mut locations = Vec::new();
        for (path, range_ids) in grouped {
            let document = self
                .document_data(&path)
                .await?
                .context(MalformedBundleSnafu {
                    filename: self.filename.as_str(),
                    name: "document",
                    key: path.as_str(),
                })?;

            for range_id in range_ids {
                let r = document.ranges.get(&range_id).context(MalformedBundleSnafu {
                    filename: self.filename.as_str(),
                    name: "range",
                    key: range_id.as_str(),
                })?;

                locations.push(Location {
                    path: path.clone(),
                    range: r.extent(),
                });
            }
        }

        Ok(locations)
    }
}

/// Read the single meta row of a bundle.
fn read_meta(conn: &Connection, filename: &str) -> Result<BundleMeta> {
    conn.query_row(
        "SELECT lsifVersion, sourcegraphVersion, numResultChunks FROM meta LIMIT 1",
        [],
        |row| {
            Ok(BundleMeta {
                lsif_version: row.get(0)?,
                sourcegraph_version: row.get(1)?,
                num_result_chunks: row.get::<_, i64>(2)? as usize,
            })
        },
    )
    .optional()
    .context(StorageSnafu)?
    .context(MissingMetaRowSnafu { filename })
}

/// Compute the result chunk bucket for an identifier.
///
/// This mirrors the string hash the bundle producer uses to shard result
/// sets: 32-bit wrapping `h = h * 31 + c` over the identifier's characters,
/// absolute value, modulo the chunk count. It must track the producer, not
/// local taste.
pub(crate) fn hash_key(id: &Id, num_result_chunks: usize) -> usize {
    let mut hash: i32 = 0;
    for c in id.as_str().chars() {
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32);
    }

    hash.unsigned_abs() as usize % num_result_chunks
}
