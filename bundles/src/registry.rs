//! Tracks the open [`Database`] handles of a bundle directory, see
//! [`Registry`].

use crate::{
    database::{Database, DocumentDataCache, ResultChunkDataCache},
    Result,
};
use lru::LruCache;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
};

/// A bounded map from dump identifier to open [`Database`].
///
/// Queries borrow handles as `Arc` clones, so evicting or removing an entry
/// never closes a handle out from under a running query: the connection is
/// released when the last borrower drops its clone. Whenever a handle
/// leaves the registry (eviction or [`Registry::remove`]) every shared
/// cache entry belonging to its bundle file is invalidated. Deleting a
/// bundle file without calling [`Registry::remove`] first risks serving
/// decoded data for a file that no longer exists.
pub struct Registry {
    bundle_dir: PathBuf,
    max_open_databases: usize,
    document_data_cache: Arc<DocumentDataCache>,
    result_chunk_data_cache: Arc<ResultChunkDataCache>,
    databases: Mutex<LruCache<i64, Arc<Database>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("bundle_dir", &self.bundle_dir)
            .field("max_open_databases", &self.max_open_databases)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a registry over `bundle_dir` holding at most
    /// `max_open_databases` handles open at once.
    pub fn new(
        bundle_dir: impl Into<PathBuf>,
        max_open_databases: usize,
        document_data_cache: Arc<DocumentDataCache>,
        result_chunk_data_cache: Arc<ResultChunkDataCache>,
    ) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            max_open_databases,
            document_data_cache,
            result_chunk_data_cache,
            databases: Mutex::new(LruCache::unbounded()),
        }
    }

    /// The bundle file backing the given dump.
    pub fn dump_path(&self, id: i64) -> PathBuf {
        self.bundle_dir.join("dbs").join(format!("{}.lsif.db", id))
    }

    /// Return the open database for `id`, opening the bundle file lazily.
    pub async fn database(&self, id: i64) -> Result<Arc<Database>> {
        if let Some(database) = self.databases.lock().get(&id) {
            return Ok(Arc::clone(database));
        }

        let database = Arc::new(
            Database::open(
                self.dump_path(id),
                Arc::clone(&self.document_data_cache),
                Arc::clone(&self.result_chunk_data_cache),
            )
            .await?,
        );

        let mut databases = self.databases.lock();

        // two tasks may have raced the open; the first insertion wins so
        // everyone shares one handle
        if let Some(existing) = databases.get(&id) {
            return Ok(Arc::clone(existing));
        }

        databases.put(id, Arc::clone(&database));
        while databases.len() > self.max_open_databases {
            match databases.pop_lru() {
                Some((evicted_id, evicted)) => {
                    debug!(id = evicted_id, filename = evicted.filename(), "evicting bundle handle");
                    self.invalidate(evicted.filename());
                }
                None => break,
            }
        }

        Ok(database)
    }

    /// Drop the handle for `id` (if open) and invalidate every cache entry
    /// of its bundle file. Must be called before the file is deleted.
    pub fn remove(&self, id: i64) {
        self.databases.lock().pop(&id);
        self.invalidate(&self.dump_path(id).to_string_lossy());
    }

    fn invalidate(&self, filename: &str) {
        let prefix = format!("{}::", filename);
        self.document_data_cache.invalidate_prefix(&prefix);
        self.result_chunk_data_cache.invalidate_prefix(&prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_lsif_go_bundle;
    use tempfile::TempDir;

    fn test_registry(dir: &TempDir, max_open_databases: usize) -> Registry {
        Registry::new(
            dir.path(),
            max_open_databases,
            Arc::new(DocumentDataCache::new("documents", 10 * 1024 * 1024)),
            Arc::new(ResultChunkDataCache::new("result-chunks", 10 * 1024 * 1024)),
        )
    }

    fn write_bundles(dir: &TempDir, ids: &[i64]) {
        std::fs::create_dir_all(dir.path().join("dbs")).unwrap();
        for id in ids {
            build_lsif_go_bundle(&dir.path().join("dbs").join(format!("{}.lsif.db", id)));
        }
    }

    #[tokio::test]
    async fn test_open_is_lazy_and_shared() {
        test_helpers::maybe_start_logging();
        let dir = TempDir::new().unwrap();
        write_bundles(&dir, &[42]);

        let registry = test_registry(&dir, 4);

        let first = registry.database(42).await.unwrap();
        let second = registry.database(42).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(first.exists("cmd/lsif-go/main.go").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_bundle_file_fails_open() {
        test_helpers::maybe_start_logging();
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("dbs")).unwrap();

        let registry = test_registry(&dir, 4);
        assert!(registry.database(7).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_invalidates_cache_entries() {
        test_helpers::maybe_start_logging();
        let dir = TempDir::new().unwrap();
        write_bundles(&dir, &[1, 2]);

        let registry = test_registry(&dir, 4);

        // decode documents of both bundles into the shared cache
        for id in [1, 2] {
            let db = registry.database(id).await.unwrap();
            assert!(db.exists("protocol/writer.go").await.unwrap());
        }
        let cached = registry.document_data_cache.len();
        assert_eq!(cached, 2);

        registry.remove(1);

        // only bundle 1's entries are gone
        assert_eq!(registry.document_data_cache.len(), 1);
        let prefix = registry.dump_path(2).to_string_lossy().into_owned();
        assert!(registry
            .document_data_cache
            .contains_key(&format!("{}::protocol/writer.go", prefix)));
    }

    #[tokio::test]
    async fn test_remove_without_open_handle_still_invalidates() {
        test_helpers::maybe_start_logging();
        let dir = TempDir::new().unwrap();
        write_bundles(&dir, &[5]);

        let registry = test_registry(&dir, 4);

        let db = registry.database(5).await.unwrap();
        assert!(db.exists("protocol/writer.go").await.unwrap());

        // evict the handle but keep the decoded document cached
        registry.databases.lock().pop(&5);
        assert_eq!(registry.document_data_cache.len(), 1);

        registry.remove(5);
        assert_eq!(registry.document_data_cache.len(), 0);
    }

    #[tokio::test]
    async fn test_eviction_closes_least_recently_used() {
        test_helpers::maybe_start_logging();
        let dir = TempDir::new().unwrap();
        write_bundles(&dir, &[1, 2, 3]);

        let registry = test_registry(&dir, 2);

        let db1 = registry.database(1).await.unwrap();
        assert!(db1.exists("protocol/writer.go").await.unwrap());
        registry.database(2).await.unwrap();

        // touching 1 makes 2 the eviction candidate
        registry.database(1).await.unwrap();
        registry.database(3).await.unwrap();

        let open: Vec<i64> = {
            let databases = registry.databases.lock();
            databases.iter().map(|(id, _)| *id).collect()
        };
        assert_eq!(open.len(), 2);
        assert!(open.contains(&1));
        assert!(open.contains(&3));

        // bundle 1 survived eviction rounds, its cache entries are intact
        let prefix = registry.dump_path(1).to_string_lossy().into_owned();
        assert!(registry
            .document_data_cache
            .contains_key(&format!("{}::protocol/writer.go", prefix)));
    }
}
