//! Helpers that write bundle fixtures to disk for tests.

use crate::database::hash_key;
use bundle_types::Id;
use flate2::{write::GzEncoder, Compression};
use rusqlite::{params, Connection};
use serde_json::{json, Map, Value};
use std::{io::Write, path::Path};

/// Gzip a JSON value the way the indexing pipeline writes blob rows.
pub(crate) fn gzip_json(value: &Value) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(value.to_string().as_bytes())
        .expect("write blob");
    encoder.finish().expect("finish blob")
}

/// Writes a bundle SQLite file row by row.
pub(crate) struct BundleBuilder {
    conn: Connection,
}

impl BundleBuilder {
    /// Create the bundle schema at `path`. No meta row is written; call
    /// [`BundleBuilder::with_meta`] for a usable bundle.
    pub(crate) fn new(path: &Path) -> Self {
        let conn = Connection::open(path).expect("open fixture bundle");
        conn.execute_batch(
            r#"
            CREATE TABLE meta (
                id INTEGER PRIMARY KEY,
                lsifVersion TEXT,
                sourcegraphVersion TEXT,
                numResultChunks INTEGER
            );
            CREATE TABLE documents (path TEXT PRIMARY KEY, data BLOB);
            CREATE TABLE resultChunks (id INTEGER PRIMARY KEY, data BLOB);
            CREATE TABLE definitions (
                id INTEGER PRIMARY KEY,
                scheme TEXT,
                identifier TEXT,
                documentPath TEXT,
                startLine INTEGER,
                startCharacter INTEGER,
                endLine INTEGER,
                endCharacter INTEGER
            );
            CREATE TABLE "references" (
                id INTEGER PRIMARY KEY,
                scheme TEXT,
                identifier TEXT,
                documentPath TEXT,
                startLine INTEGER,
                startCharacter INTEGER,
                endLine INTEGER,
                endCharacter INTEGER
            );
            "#,
        )
        .expect("create fixture schema");

        Self { conn }
    }

    pub(crate) fn with_meta(self, num_result_chunks: usize) -> Self {
        self.conn
            .execute(
                "INSERT INTO meta (id, lsifVersion, sourcegraphVersion, numResultChunks) \
                 VALUES (1, '0.4.3', '3.15.0', ?1)",
                params![num_result_chunks as i64],
            )
            .expect("insert meta row");
        self
    }

    pub(crate) fn document(&self, path: &str, data: &Value) -> &Self {
        self.conn
            .execute(
                "INSERT INTO documents (path, data) VALUES (?1, ?2)",
                params![path, gzip_json(data)],
            )
            .expect("insert document row");
        self
    }

    pub(crate) fn result_chunk(&self, id: usize, data: &Value) -> &Self {
        self.conn
            .execute(
                "INSERT INTO resultChunks (id, data) VALUES (?1, ?2)",
                params![id as i64, gzip_json(data)],
            )
            .expect("insert result chunk row");
        self
    }

    pub(crate) fn moniker_row(
        &self,
        table: &str,
        scheme: &str,
        identifier: &str,
        document_path: &str,
        range: (u32, u32, u32, u32),
    ) -> &Self {
        let query = format!(
            "INSERT INTO \"{}\" (scheme, identifier, documentPath, \
             startLine, startCharacter, endLine, endCharacter) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table
        );
        self.conn
            .execute(
                &query,
                params![scheme, identifier, document_path, range.0, range.1, range.2, range.3],
            )
            .expect("insert moniker row");
        self
    }
}

/// Accumulates result chunk contents per shard, placing each result where
/// the production hash expects to find it (unless told otherwise).
pub(crate) struct ChunkSet {
    num_result_chunks: usize,
    shards: Vec<Option<Shard>>,
}

#[derive(Default)]
struct Shard {
    document_paths: Map<String, Value>,
    document_id_range_ids: Map<String, Value>,
}

impl ChunkSet {
    pub(crate) fn new(num_result_chunks: usize) -> Self {
        Self {
            num_result_chunks,
            shards: (0..num_result_chunks).map(|_| None).collect(),
        }
    }

    /// Record `result_id` resolving to the given
    /// `(document id, path, range id)` pairs, in the shard its hash selects.
    pub(crate) fn add(&mut self, result_id: &str, pairs: &[(&str, &str, &str)]) {
        let shard = hash_key(&Id::from(result_id), self.num_result_chunks);
        self.add_to_shard(shard, result_id, pairs);
    }

    /// Record `result_id` in an explicitly chosen shard. Tests use this to
    /// misplace results.
    pub(crate) fn add_to_shard(
        &mut self,
        shard: usize,
        result_id: &str,
        pairs: &[(&str, &str, &str)],
    ) {
        let shard = self.shards[shard].get_or_insert_with(Shard::default);

        let mut entries = Vec::with_capacity(pairs.len());
        for (document_id, path, range_id) in pairs {
            shard
                .document_paths
                .insert((*document_id).to_string(), json!(path));
            entries.push(json!({"documentId": document_id, "rangeId": range_id}));
        }

        shard
            .document_id_range_ids
            .insert(result_id.to_string(), Value::Array(entries));
    }

    /// Write one `resultChunks` row per populated shard.
    pub(crate) fn write(&self, builder: &BundleBuilder) {
        for (id, shard) in self.shards.iter().enumerate() {
            if let Some(shard) = shard {
                builder.result_chunk(
                    id,
                    &json!({
                        "documentPaths": Value::Object(shard.document_paths.clone()),
                        "documentIdRangeIds": Value::Object(shard.document_id_range_ids.clone()),
                    }),
                );
            }
        }
    }
}

/// A synthetic bundle shaped like an indexed `lsif-go` repository; the
/// database tests assert against the positions recorded here.
pub(crate) fn build_lsif_go_bundle(path: &Path) {
    const NUM_RESULT_CHUNKS: usize = 4;

    let builder = BundleBuilder::new(path).with_meta(NUM_RESULT_CHUNKS);

    // `s, err := indexer.Index()`, the use site of Index
    builder.document(
        "cmd/lsif-go/main.go",
        &json!({
            "ranges": {
                "m1": {"startLine": 110, "startCharacter": 21,
                       "endLine": 110, "endCharacter": 26,
                       "definitionResultId": "d1"}
            }
        }),
    );

    let docstring = "findContents returns contents used as hover info for given object.";
    let signature = "func findContents(pkgs []*Package, p *Package, f *File, obj Object) ([]MarkedString, error)";
    builder.document(
        "internal/index/indexer.go",
        &json!({
            "ranges": {
                // `Index() (*Stats, error)`, the definition
                "i1": {"startLine": 20, "startCharacter": 1,
                       "endLine": 20, "endCharacter": 6},
                // the two EmitRange call sites
                "i529": {"startLine": 529, "startCharacter": 22,
                         "endLine": 529, "endCharacter": 31},
                "i380": {"startLine": 380, "startCharacter": 22,
                         "endLine": 380, "endCharacter": 31},
                // `contents, err := findContents(...)`
                "h1": {"startLine": 628, "startCharacter": 18,
                       "endLine": 628, "endCharacter": 30,
                       "hoverResultId": "hov1"}
            },
            "hoverResults": {
                "hov1": format!("```go\n{}\n```\n\n---\n\n{}", signature, docstring)
            }
        }),
    );

    // `func (w *Writer) EmitRange(start, end Pos) (string, error)`
    builder.document(
        "protocol/writer.go",
        &json!({
            "ranges": {
                "w1": {"startLine": 85, "startCharacter": 17,
                       "endLine": 85, "endCharacter": 26,
                       "referenceResultId": "r1"}
            }
        }),
    );

    // `func NewMetaData(id, root string, info ToolInfo) *MetaData`
    builder.document(
        "protocol/protocol.go",
        &json!({
            "ranges": {
                "p1": {"startLine": 92, "startCharacter": 5,
                       "endLine": 92, "endCharacter": 16,
                       "monikerIds": ["mon1"]}
            },
            "monikers": {
                "mon1": {"kind": "export", "scheme": "gomod",
                         "identifier": "github.com/sourcegraph/lsif-go/protocol:NewMetaData",
                         "packageInformationId": "213"}
            },
            "packageInformation": {
                "213": {"name": "github.com/sourcegraph/lsif-go",
                        "version": "v0.0.0-ad3507cbeb18"}
            }
        }),
    );

    let mut chunks = ChunkSet::new(NUM_RESULT_CHUNKS);
    chunks.add("d1", &[("doc-indexer", "internal/index/indexer.go", "i1")]);
    chunks.add(
        "r1",
        &[
            ("doc-writer", "protocol/writer.go", "w1"),
            ("doc-indexer", "internal/index/indexer.go", "i529"),
            ("doc-indexer", "internal/index/indexer.go", "i380"),
        ],
    );
    chunks.write(&builder);

    // ten definition rows for protocol:Edge and one reference row
    for (line, character) in [
        (600, 1),
        (644, 1),
        (507, 1),
        (553, 1),
        (462, 1),
        (484, 1),
        (410, 5),
        (622, 1),
        (440, 1),
        (530, 1),
    ] {
        builder.moniker_row(
            "definitions",
            "gomod",
            "github.com/sourcegraph/lsif-go/protocol:Edge",
            "protocol/protocol.go",
            (line, character, line, character + 4),
        );
    }
    builder.moniker_row(
        "references",
        "gomod",
        "github.com/slimsag/godocmd:ToMarkdown",
        "internal/index/helper.go",
        (78, 6, 78, 16),
    );
}
