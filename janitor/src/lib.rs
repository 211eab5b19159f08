//! Reclaims disk space in the bundle directory.
//!
//! The [`Janitor`] runs three independent, idempotent sweeps on a periodic
//! tick: deleting uploads that never finished converting, deleting bundle
//! files whose owning dump record disappeared upstream, and evicting
//! least-recently-used completed bundles when the directory grows past its
//! size budget. Every deletion goes through the [`bundles::Registry`] first
//! so no query keeps serving decoded data for a file that is gone.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod oracle;

pub use oracle::{DumpOracle, OracleError};

use bundles::Registry;
use observability_deps::tracing::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};
use std::{
    ffi::OsStr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;

/// Cap on the number of dump identifiers per state request.
pub const DEAD_DUMP_BATCH_SIZE: usize = 100;

/// Failures of a whole sweep. Failures affecting a single file are logged
/// and skipped instead so one bad entry cannot wedge the sweep.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error reading directory {}: {}", path.display(), source))]
    ReadDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error requesting dump states: {}", source))]
    DumpStates { source: OracleError },

    #[snafu(display("error requesting prunable dump: {}", source))]
    PrunableDump { source: OracleError },
}

/// Result type of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Janitor configuration.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Root directory holding the `uploads/` and `dbs/` trees.
    pub bundle_dir: PathBuf,

    /// Uploads whose mtime is older than this never finished converting
    /// and are deleted.
    pub max_unconverted_upload_age: Duration,

    /// Maximum number of identifiers per oracle state request.
    pub dead_dump_batch_size: usize,

    /// Size budget for the completed bundle tree in bytes. Exceeding it
    /// triggers eviction of prunable dumps.
    pub max_dumps_size_bytes: u64,

    /// Delay between maintenance passes.
    pub cleanup_interval: Duration,
}

/// Periodically reclaims disk space in the bundle directory.
#[derive(Debug)]
pub struct Janitor {
    config: JanitorConfig,
    oracle: Arc<dyn DumpOracle>,
    registry: Arc<Registry>,
}

impl Janitor {
    /// Create a janitor over the configured bundle directory.
    pub fn new(config: JanitorConfig, oracle: Arc<dyn DumpOracle>, registry: Arc<Registry>) -> Self {
        Self {
            config,
            oracle,
            registry,
        }
    }

    /// Run maintenance passes until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            bundle_dir = %self.config.bundle_dir.display(),
            "janitor started"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("janitor shutdown");
                return;
            }

            self.run_once().await;

            tokio::select!(
                _ = tokio::time::sleep(self.config.cleanup_interval) => {},
                _ = shutdown.cancelled() => {},
            );
        }
    }

    /// One maintenance pass. Sweep failures are logged rather than
    /// propagated; a failing sweep must not keep the following ones from
    /// running.
    pub async fn run_once(&self) {
        if let Err(e) = self.clean_failed_uploads().await {
            error!(%e, "cleaning failed uploads");
        }
        if let Err(e) = self.remove_dead_dumps().await {
            error!(%e, "removing dead dumps");
        }
        if let Err(e) = self.clean_old_dumps().await {
            error!(%e, "cleaning old dumps");
        }
    }

    /// Delete every upload older than the configured age. Uploads are
    /// written to `uploads/` and deleted once converted; anything still
    /// there after the cutoff belongs to a conversion that died.
    pub async fn clean_failed_uploads(&self) -> Result<()> {
        let dir = self.uploads_dir();
        let now = SystemTime::now();

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?
        {
            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    warn!(%e, path = %entry.path().display(), "failed to stat upload");
                    continue;
                }
            };

            if age <= self.config.max_unconverted_upload_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => info!(path = %entry.path().display(), "removed stale upload"),
                Err(e) => warn!(%e, path = %entry.path().display(), "failed to remove stale upload"),
            }
        }

        Ok(())
    }

    /// Delete every bundle file whose dump identifier the oracle no longer
    /// knows. Identifiers are queried in batches of at most
    /// `dead_dump_batch_size`; an id in any state (terminal error states
    /// included) is alive, only omission marks a file as garbage.
    pub async fn remove_dead_dumps(&self) -> Result<()> {
        let ids = self.dump_ids().await?;

        for batch in batch_ids(&ids, self.config.dead_dump_batch_size) {
            let states = self
                .oracle
                .states(batch)
                .await
                .context(DumpStatesSnafu)?;

            for id in batch {
                if states.contains_key(id) {
                    continue;
                }

                self.registry.remove(*id);

                let path = self.registry.dump_path(*id);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(id = *id, path = %path.display(), "removed dead dump"),
                    Err(e) => warn!(%e, id = *id, "failed to remove dead dump"),
                }
            }
        }

        Ok(())
    }

    /// Evict prunable dumps until the bundle tree fits its size budget.
    /// The oracle dictates the eviction order; the sweep stops early when
    /// it runs out of candidates.
    pub async fn clean_old_dumps(&self) -> Result<()> {
        let mut total_size = self.dumps_total_size().await?;

        while total_size > self.config.max_dumps_size_bytes {
            let id = match self.oracle.next_prunable().await.context(PrunableDumpSnafu)? {
                Some(id) => id,
                None => {
                    debug!(
                        total_size,
                        target = self.config.max_dumps_size_bytes,
                        "over budget but nothing prunable remains"
                    );
                    break;
                }
            };

            let path = self.registry.dump_path(id);
            let file_size = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!(%e, id, "failed to stat prunable dump");
                    continue;
                }
            };

            self.registry.remove(id);

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(id, size = file_size, "removed old dump");
                    total_size = total_size.saturating_sub(file_size);
                }
                Err(e) => warn!(%e, id, "failed to remove old dump"),
            }
        }

        Ok(())
    }

    /// The dump identifiers currently on disk, in ascending order. Files
    /// not named `<id>.lsif.db` are not dumps and are left alone.
    async fn dump_ids(&self) -> Result<Vec<i64>> {
        let dir = self.dbs_dir();

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?
        {
            if let Some(id) = parse_dump_filename(&entry.file_name()) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Total bytes currently occupied by the completed bundle tree.
    async fn dumps_total_size(&self) -> Result<u64> {
        let dir = self.dbs_dir();

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?;

        let mut total = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ReadDirectorySnafu { path: dir.as_path() })?
        {
            match entry.metadata().await {
                Ok(metadata) => total += metadata.len(),
                Err(e) => warn!(%e, path = %entry.path().display(), "failed to stat dump"),
            }
        }

        Ok(total)
    }

    fn uploads_dir(&self) -> PathBuf {
        self.config.bundle_dir.join("uploads")
    }

    fn dbs_dir(&self) -> PathBuf {
        self.config.bundle_dir.join("dbs")
    }
}

/// Parse `<id>.lsif.db` into its dump identifier.
fn parse_dump_filename(name: &OsStr) -> Option<i64> {
    name.to_str()?.strip_suffix(".lsif.db")?.parse().ok()
}

/// Split `ids` into consecutive batches of at most `size` elements; the
/// final batch may be short and empty input yields no batches. `size` must
/// be positive.
pub fn batch_ids(ids: &[i64], size: usize) -> std::slice::Chunks<'_, i64> {
    ids.chunks(size)
}
