//! Sync coordination.
//!
//! Selected catalog streams are grouped by file source and matched to exactly
//! one table spec. Each table's files are then synced by a bounded pool of
//! blocking workers, one connection per file, while `TableBookmarks`
//! serializes bookmark writes as files finish.

pub mod bookmark;
pub mod state;
pub mod stats;

pub use bookmark::{BookmarkTracker, TableBookmarks};
pub use state::{load_state, StateStore};
pub use stats::StatsRegistry;

use crate::catalog::{Catalog, CatalogStream};
use crate::config::{TableSpec, TapConfig};
use crate::decrypt::DecryptionContext;
use crate::error::{Result, TapError};
use crate::fetch::fetch_file;
use crate::format::{ReaderRegistry, SyncRequest};
use crate::resolver::{resolve, FileQuery, SizeLimit};
use crate::singer::MessageWriter;
use crate::transport::{ConnectionGuard, Connector, RemoteFileDescriptor};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Where a file is in its sync.
/// Variants are ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilePhase {
    Pending,
    ConnectionAcquired,
    Decrypting,
    HandleReady,
    Delegated,
    BookmarkUpdated,
    Closed,
    Failed,
}

impl fmt::Display for FilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilePhase::Pending => "pending",
            FilePhase::ConnectionAcquired => "connection acquired",
            FilePhase::Decrypting => "decrypting",
            FilePhase::HandleReady => "handle ready",
            FilePhase::Delegated => "delegated",
            FilePhase::BookmarkUpdated => "bookmark updated",
            FilePhase::Closed => "closed",
            FilePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Streams of one table, gathered from every group that maps to it.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub spec_index: usize,
    pub streams: Vec<CatalogStream>,
}

/// Run-scoped collaborators shared by every worker.
#[derive(Clone)]
struct Shared {
    config: TapConfig,
    connector: Arc<dyn Connector>,
    readers: ReaderRegistry,
    decryption: Option<Arc<DecryptionContext>>,
    writer: Arc<MessageWriter>,
    state: Arc<StateStore>,
    stats: Arc<StatsRegistry>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl SyncCoordinator {
    pub fn new(
        config: TapConfig,
        connector: Arc<dyn Connector>,
        writer: Arc<MessageWriter>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                readers: ReaderRegistry::with_defaults(),
                decryption: None,
                writer,
                state,
                stats: Arc::new(StatsRegistry::new()),
            }),
        }
    }

    /// Replace the format readers. Clones made earlier keep their readers.
    pub fn with_readers(mut self, readers: ReaderRegistry) -> Self {
        Arc::make_mut(&mut self.shared).readers = readers;
        self
    }

    /// Decrypt every file with `decryption`. Clones made earlier are unaffected.
    pub fn with_decryption(mut self, decryption: Option<Arc<DecryptionContext>>) -> Self {
        Arc::make_mut(&mut self.shared).decryption = decryption;
        self
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.shared.stats)
    }

    /// The single table spec matching a group key, or `None` (logged) when
    /// zero or several match.
    pub fn match_spec(&self, file_source: &str) -> Result<Option<usize>> {
        let mut matches = Vec::new();
        for (idx, spec) in self.shared.config.tables.iter().enumerate() {
            if spec.name() == file_source || spec.source_matcher()?.is_match(file_source) {
                matches.push(idx);
            }
        }
        match matches.as_slice() {
            [idx] => Ok(Some(*idx)),
            [] => {
                info!(
                    "No table configuration found for '{}', skipping stream",
                    file_source
                );
                Ok(None)
            }
            _ => {
                info!(
                    "Multiple table configurations found for '{}', skipping stream",
                    file_source
                );
                Ok(None)
            }
        }
    }

    /// Group selected streams and map each group to its table.
    pub fn plan(&self, catalog: &Catalog) -> Result<Vec<TablePlan>> {
        let mut plans: Vec<TablePlan> = Vec::new();
        for group in catalog.selected_groups() {
            let Some(spec_index) = self.match_spec(&group.file_source)? else {
                continue;
            };
            match plans.iter_mut().find(|p| p.spec_index == spec_index) {
                Some(plan) => {
                    for stream in group.streams {
                        if !plan
                            .streams
                            .iter()
                            .any(|s| s.tap_stream_id == stream.tap_stream_id)
                        {
                            plan.streams.push(stream);
                        }
                    }
                }
                None => plans.push(TablePlan {
                    spec_index,
                    streams: group.streams,
                }),
            }
        }
        Ok(plans)
    }

    /// Sync every selected stream in `catalog`. Returns the records written.
    pub async fn sync(&self, catalog: &Catalog) -> Result<u64> {
        info!("Starting sync.");
        let plans = self.plan(catalog)?;
        self.shared.state.emit()?;

        let outcome = self.sync_plans(plans).await;
        // files finished before a table failure still belong in the summary
        info!("\n\n{}", self.shared.stats.render());
        let total = outcome?;
        info!("Done syncing.");
        Ok(total)
    }

    async fn sync_plans(&self, plans: Vec<TablePlan>) -> Result<u64> {
        let mut total = 0;
        for plan in plans {
            for stream in &plan.streams {
                self.shared.writer.write_schema(
                    &stream.tap_stream_id,
                    &stream.schema,
                    &stream.key_properties(),
                )?;
            }
            let spec = &self.shared.config.tables[plan.spec_index];
            info!("{}: Starting sync", spec.name());
            let rows = self.sync_table(plan.spec_index, plan.streams).await?;
            info!("{}: Completed sync ({} rows)", spec.name(), rows);
            total += rows;
        }
        Ok(total)
    }

    /// Sync the files of one table that changed since its bookmark.
    pub async fn sync_table(&self, spec_index: usize, streams: Vec<CatalogStream>) -> Result<u64> {
        let spec = self.shared.config.tables[spec_index].clone();
        let table = spec.name().to_string();
        let modified_since = self
            .shared
            .state
            .bookmark(&table)?
            .unwrap_or(self.shared.config.start_date);

        info!("Syncing table \"{}\".", table);
        info!("Getting files modified since {}.", modified_since);

        let files = {
            let shared = Arc::clone(&self.shared);
            let spec = spec.clone();
            tokio::task::spawn_blocking(move || shared.list_table_files(&spec, modified_since))
                .await
                .map_err(|e| TapError::Task(e.to_string()))??
        };
        info!("Found {} files to be synced.", files.len());
        if files.is_empty() {
            return Ok(0);
        }
        SizeLimit::new(self.shared.config.max_file_size_kb()).check(&files)?;

        let bookmarks = Arc::new(TableBookmarks::new(
            &table,
            files.iter().map(|f| f.last_modified),
            Arc::clone(&self.shared.state),
        ));
        let streams = Arc::new(streams);
        let semaphore = Arc::new(Semaphore::new(self.shared.config.max_workers));
        let mut workers = JoinSet::new();

        for file in files.iter().cloned() {
            let shared = Arc::clone(&self.shared);
            let spec = spec.clone();
            let streams = Arc::clone(&streams);
            let bookmarks = Arc::clone(&bookmarks);
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TapError::Task("worker pool closed".to_string()))?;
                tokio::task::spawn_blocking(move || {
                    shared.sync_file(&spec, &streams, &file, modified_since, &bookmarks)
                })
                .await
                .map_err(|e| TapError::Task(e.to_string()))?
            });
        }

        let mut rows = 0;
        let mut failed = 0;
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(|e| TapError::Task(e.to_string())).and_then(|r| r);
            match outcome {
                Ok(count) => rows += count,
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Wrote {} records for table \"{}\".", rows, table);
        match first_error {
            None => Ok(rows),
            Some(first) => Err(TapError::TableSyncFailed {
                table,
                failed,
                total: files.len(),
                first: Box::new(first),
            }),
        }
    }
}

impl Shared {
    fn list_table_files(
        &self,
        spec: &TableSpec,
        modified_since: DateTime<Utc>,
    ) -> Result<Vec<RemoteFileDescriptor>> {
        let mut guard = ConnectionGuard::acquire(self.connector.as_ref())?;
        let query = FileQuery::for_table(spec)
            .modified_since(modified_since)
            .recursive(self.config.search_subdirectories);
        let files = resolve(guard.fs()?, &query)?.into_sync_files(&query)?;
        guard.close()?;
        Ok(files)
    }

    /// Sync one file on its own connection and report it to `bookmarks`.
    fn sync_file(
        &self,
        spec: &TableSpec,
        streams: &[CatalogStream],
        file: &RemoteFileDescriptor,
        modified_since: DateTime<Utc>,
        bookmarks: &TableBookmarks,
    ) -> Result<u64> {
        let mut phase = FilePhase::Pending;
        let result = self.run_file(spec, streams, file, modified_since, bookmarks, &mut phase);
        match &result {
            Ok(rows) => debug!("{}: {} rows, {}", file.filepath, rows, FilePhase::Closed),
            Err(e) => {
                if phase < FilePhase::BookmarkUpdated {
                    bookmarks.fail(file.last_modified);
                }
                error!(
                    "Syncing file \"{}\" {} after {}: {}",
                    file.filepath,
                    FilePhase::Failed,
                    phase,
                    e
                );
            }
        }
        result
    }

    fn run_file(
        &self,
        spec: &TableSpec,
        streams: &[CatalogStream],
        file: &RemoteFileDescriptor,
        modified_since: DateTime<Utc>,
        bookmarks: &TableBookmarks,
        phase: &mut FilePhase,
    ) -> Result<u64> {
        info!("Syncing file \"{}\".", file.filepath);
        let reader = self.readers.get(spec.file_type)?;

        let mut guard = ConnectionGuard::acquire(self.connector.as_ref())?;
        *phase = FilePhase::ConnectionAcquired;

        if self.decryption.is_some() {
            *phase = FilePhase::Decrypting;
        }
        let handle = fetch_file(guard.fs()?, file, self.decryption.as_deref())?;
        *phase = FilePhase::HandleReady;

        let rows = reader.sync_records(&SyncRequest {
            handle: &handle,
            spec,
            streams,
            modified_since,
            writer: &self.writer,
        })?;
        *phase = FilePhase::Delegated;
        self.stats
            .record(spec, &file.filepath, file.last_modified, rows);

        bookmarks.complete(file.last_modified)?;
        *phase = FilePhase::BookmarkUpdated;

        if self.config.delete_after_sync {
            info!("Deleting remote file: {}", file.filepath);
            guard.fs()?.remove(&file.filepath)?;
        }
        drop(handle);
        if let Err(e) = guard.close() {
            warn!("Failed to close connection for {}: {}", file.filepath, e);
        }
        *phase = FilePhase::Closed;
        Ok(rows)
    }
}
