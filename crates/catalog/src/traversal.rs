//! Recursive traversal of the catalog hierarchy.
//!
//! The engine walks a repository's catalog DAG across nested-catalog edges
//! and previous-revision edges, handing every qualifying catalog to the
//! registered listeners exactly once.
//!
//! Breadth-first traversal emits catalogs top to bottom and newest revision
//! first; catalogs are opened, emitted, and closed immediately. Depth-first
//! traversal emits leaves before their parents and old revisions before new
//! ones; catalogs whose descendants are still pending are closed and parked
//! on a callback stack, then re-opened for the deferred emission. Depth-first
//! therefore needs more disk space for not-yet-emitted catalog files.
//!
//! The catalog reference passed to a listener is only valid for the duration
//! of the callback unless the traversal runs with `no_close`, in which case
//! emitted catalogs stay attached and can be looked up by hash afterwards.

use crate::error::{FetchError, Result, TraversalError};
use crate::fetcher::{CatalogHandle, ObjectFetcher};
use crate::queue::{CatalogJob, JobStack};
use cairn_core::Digest;
use std::collections::{HashMap, HashSet};

/// Direction in which the catalog hierarchy is handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalStrategy {
    BreadthFirst,
    DepthFirst,
}

/// Traversal configuration.
#[derive(Clone, Debug)]
pub struct TraversalParams {
    /// Maximum history depth to follow via previous-revision edges.
    /// 0 traverses HEAD only, [`TraversalParams::FULL_HISTORY`] is unlimited.
    pub history: u32,
    /// Minimum last-modified timestamp. A root catalog older than this is
    /// still emitted but its previous-revision edge is not followed.
    pub timestamp: u64,
    /// Skip catalogs that were already visited in another revision.
    pub no_repeat_history: bool,
    /// Keep emitted catalogs attached; the caller takes over closing and
    /// unlinking them.
    pub no_close: bool,
    /// Tolerate missing catalogs (swept by garbage collection) instead of
    /// failing the traversal.
    pub ignore_load_failure: bool,
    /// Route error lines to the debug log.
    pub quiet: bool,
}

impl TraversalParams {
    /// Follow previous-revision edges without a depth limit.
    pub const FULL_HISTORY: u32 = u32::MAX;
    /// Traverse the entry revision only.
    pub const NO_HISTORY: u32 = 0;
    /// No timestamp threshold.
    pub const NO_TIMESTAMP: u64 = 0;
}

impl Default for TraversalParams {
    fn default() -> Self {
        Self {
            history: Self::NO_HISTORY,
            timestamp: Self::NO_TIMESTAMP,
            no_repeat_history: false,
            no_close: false,
            ignore_load_failure: false,
            quiet: false,
        }
    }
}

/// Data handed to listeners for every emitted catalog.
pub struct CatalogData<'a, C> {
    /// The opened catalog. Invalid after the callback returns unless the
    /// traversal runs with `no_close`.
    pub catalog: &'a C,
    /// Content hash of the catalog.
    pub hash: Digest,
    /// Depth in the nested-catalog tree, starting at zero.
    pub tree_level: u32,
    /// Size of the downloaded catalog database file.
    pub file_size: u64,
    /// Distance from the HEAD revision; HEAD is zero.
    pub history_depth: u32,
}

/// A traversal observer. Returning `false` aborts the traversal.
pub type Listener<C> = Box<dyn FnMut(&CatalogData<'_, C>) -> bool + Send>;

/// Pluggable source of a catalog's effective last-modified timestamp.
///
/// The default reads the timestamp stored in the catalog itself. Garbage
/// collection substitutes a reflog-derived timestamp, which is the same or
/// newer.
pub trait TimestampSource<C>: Send {
    fn last_modified(&self, catalog: &C) -> u64;
}

/// Default timestamp source: the catalog's own modification time.
pub struct CatalogModTime;

impl<C: CatalogHandle> TimestampSource<C> for CatalogModTime {
    fn last_modified(&self, catalog: &C) -> u64 {
        catalog.last_modified()
    }
}

/// Per-run traversal state: pruning thresholds, the job stack, and the
/// callback stack used for deferred depth-first emission.
struct TraversalContext<C> {
    history_depth: u32,
    timestamp_threshold: u64,
    strategy: TraversalStrategy,
    catalog_stack: JobStack<C>,
    callback_stack: JobStack<C>,
}

impl<C> TraversalContext<C> {
    fn new(history_depth: u32, timestamp_threshold: u64, strategy: TraversalStrategy) -> Self {
        Self {
            history_depth,
            timestamp_threshold,
            strategy,
            catalog_stack: JobStack::new(),
            callback_stack: JobStack::new(),
        }
    }
}

/// The catalog traversal engine.
///
/// Start modes:
/// - [`traverse`](Self::traverse) enters at the repository manifest's HEAD.
/// - [`traverse_from`](Self::traverse_from) enters at a given root hash with
///   the configured pruning.
/// - [`traverse_list`](Self::traverse_list) explores each listed revision
///   without following previous-revision edges.
/// - [`traverse_named_snapshots`](Self::traverse_named_snapshots) uses every
///   named snapshot in the history database as an entry point.
pub struct CatalogTraversal<F: ObjectFetcher> {
    fetcher: F,
    params: TraversalParams,
    listeners: Vec<Listener<F::Catalog>>,
    timestamp_source: Box<dyn TimestampSource<F::Catalog>>,
    visited: HashSet<Digest>,
    retained: HashMap<Digest, F::Catalog>,
}

impl<F: ObjectFetcher> CatalogTraversal<F> {
    /// Create a traversal engine over the given fetcher.
    pub fn new(fetcher: F, params: TraversalParams) -> Self {
        Self {
            fetcher,
            params,
            listeners: Vec::new(),
            timestamp_source: Box::new(CatalogModTime),
            visited: HashSet::new(),
            retained: HashMap::new(),
        }
    }

    /// Register a listener. Listeners are invoked synchronously in
    /// registration order for every emitted catalog.
    pub fn register_listener<L>(&mut self, listener: L)
    where
        L: FnMut(&CatalogData<'_, F::Catalog>) -> bool + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Replace the timestamp source used for pruning decisions.
    pub fn set_timestamp_source<T>(&mut self, source: T)
    where
        T: TimestampSource<F::Catalog> + 'static,
    {
        self.timestamp_source = Box::new(source);
    }

    /// The underlying fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Catalogs retained by a `no_close` traversal, indexed by hash.
    pub fn retained_catalogs(&self) -> &HashMap<Digest, F::Catalog> {
        &self.retained
    }

    /// Take ownership of all retained catalogs.
    pub fn take_retained(&mut self) -> HashMap<Digest, F::Catalog> {
        std::mem::take(&mut self.retained)
    }

    /// Traverse starting at the repository HEAD, taken from the manifest.
    pub async fn traverse(&mut self, strategy: TraversalStrategy) -> Result<()> {
        let manifest = match self.fetcher.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.log_error(&format!("failed to load manifest ({})", e.code_name()));
                return Err(TraversalError::Manifest(e));
            }
        };
        self.traverse_from(&manifest.catalog_hash, strategy).await
    }

    /// Traverse starting at the given root catalog hash.
    pub async fn traverse_from(
        &mut self,
        root_hash: &Digest,
        strategy: TraversalStrategy,
    ) -> Result<()> {
        let mut ctx = TraversalContext::new(self.params.history, self.params.timestamp, strategy);
        ctx.catalog_stack.push(CatalogJob::root(*root_hash, 0));
        self.do_traverse(&mut ctx).await
    }

    /// Traverse a single revision, never following its previous-revision
    /// edge regardless of the configured history depth.
    pub async fn traverse_revision(
        &mut self,
        root_hash: &Digest,
        strategy: TraversalStrategy,
    ) -> Result<()> {
        let mut ctx = TraversalContext::new(
            TraversalParams::NO_HISTORY,
            TraversalParams::NO_TIMESTAMP,
            strategy,
        );
        ctx.catalog_stack.push(CatalogJob::root(*root_hash, 0));
        self.do_traverse(&mut ctx).await
    }

    /// Traverse a list of revisions from first to last, each without
    /// previous-revision edges.
    pub async fn traverse_list(
        &mut self,
        root_hashes: &[Digest],
        strategy: TraversalStrategy,
    ) -> Result<()> {
        for hash in root_hashes {
            self.traverse_revision(hash, strategy).await?;
        }
        Ok(())
    }

    /// Use all named snapshots of the repository as traversal entry points.
    /// A repository without a history database traverses nothing.
    pub async fn traverse_named_snapshots(&mut self, strategy: TraversalStrategy) -> Result<()> {
        use crate::fetcher::HistoryHandle;

        let history = match self.fetcher.fetch_history().await {
            Ok(history) => history,
            Err(FetchError::NotFound) => {
                tracing::debug!("didn't find a history database to traverse");
                return Ok(());
            }
            Err(e) => {
                self.log_error(&format!(
                    "failed to download history database ({})",
                    e.code_name()
                ));
                return Err(e.into());
            }
        };

        let root_hashes = history.snapshot_hashes();
        self.traverse_list(&root_hashes, strategy).await
    }

    /// The traversal loop. Pops jobs, fetches and opens their catalogs,
    /// pushes outgoing edges, and hands catalogs to the listeners according
    /// to the strategy.
    async fn do_traverse(&mut self, ctx: &mut TraversalContext<F::Catalog>) -> Result<()> {
        debug_assert!(ctx.callback_stack.is_empty());

        while let Some(mut job) = ctx.catalog_stack.pop() {
            if self.should_be_skipped(&job) {
                job.ignore = true;
            } else {
                self.prepare_catalog(&mut job).await?;
            }

            // Ignored catalogs emit nothing but may still release postponed
            // yields of their enclosing parents.
            if job.ignore {
                self.handle_postponed_yields(ctx).await?;
                continue;
            }

            self.mark_as_visited(&job);
            self.push_referenced_catalogs(&mut job, ctx);
            self.yield_to_listeners(job, ctx).await?;
        }

        debug_assert!(ctx.callback_stack.is_empty());
        Ok(())
    }

    /// Fetch and open the job's catalog. A not-found is downgraded to an
    /// ignored job when tolerated; everything else is fatal.
    async fn prepare_catalog(&mut self, job: &mut CatalogJob<F::Catalog>) -> Result<()> {
        let parent = job
            .parent_hash
            .as_ref()
            .and_then(|hash| self.retained.get(hash));
        let fetched = self
            .fetcher
            .fetch_catalog(&job.hash, &job.mountpoint, parent, !job.is_root())
            .await;

        let mut catalog = match fetched {
            Ok(catalog) => catalog,
            Err(FetchError::NotFound) if self.params.ignore_load_failure => {
                tracing::debug!(
                    hash = %job.hash,
                    "ignoring missing catalog (swept before?)"
                );
                job.ignore = true;
                return Ok(());
            }
            Err(e) => {
                self.log_error(&format!(
                    "failed to load catalog {} ({})",
                    job.hash.to_hex_suffixed(),
                    e.code_name()
                ));
                return Err(e.into());
            }
        };

        // The engine manages the database file from here on; the handle must
        // not delete it behind our back.
        catalog.drop_database_ownership();
        job.catalog_file_path = catalog.database_path();
        job.catalog_file_size = match tokio::fs::metadata(&job.catalog_file_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        job.catalog = Some(catalog);
        Ok(())
    }

    fn should_be_skipped(&self, job: &CatalogJob<F::Catalog>) -> bool {
        self.params.no_repeat_history && self.visited.contains(&job.hash)
    }

    fn mark_as_visited(&mut self, job: &CatalogJob<F::Catalog>) {
        if self.params.no_repeat_history {
            self.visited.insert(job.hash);
        }
    }

    /// Push the job's outgoing edges. The push order realizes the strategy:
    /// breadth-first pushes the previous revision below the nested catalogs
    /// so descent happens first; depth-first pushes it on top so history is
    /// exhausted before the current revision is emitted.
    fn push_referenced_catalogs(
        &mut self,
        job: &mut CatalogJob<F::Catalog>,
        ctx: &mut TraversalContext<F::Catalog>,
    ) {
        job.referenced_catalogs = match ctx.strategy {
            TraversalStrategy::BreadthFirst => {
                let previous = self.push_previous_revision(job, ctx);
                previous + self.push_nested_catalogs(job, ctx)
            }
            TraversalStrategy::DepthFirst => {
                let nested = self.push_nested_catalogs(job, ctx);
                nested + self.push_previous_revision(job, ctx)
            }
        };
    }

    /// Push the previous revision of a root catalog, unless pruned. The
    /// current catalog is emitted either way; pruning only drops the edge.
    fn push_previous_revision(
        &self,
        job: &CatalogJob<F::Catalog>,
        ctx: &mut TraversalContext<F::Catalog>,
    ) -> u32 {
        let Some(catalog) = job.catalog.as_ref() else {
            return 0;
        };
        if !catalog.is_root() {
            return 0;
        }
        let previous = catalog.previous_revision();
        if previous.is_null() {
            return 0;
        }
        if job.history_depth >= ctx.history_depth {
            return 0;
        }
        if self.timestamp_source.last_modified(catalog) < ctx.timestamp_threshold {
            return 0;
        }

        ctx.catalog_stack
            .push(CatalogJob::root(previous, job.history_depth + 1));
        1
    }

    /// Push all nested catalogs referenced by the job's catalog.
    fn push_nested_catalogs(
        &self,
        job: &CatalogJob<F::Catalog>,
        ctx: &mut TraversalContext<F::Catalog>,
    ) -> u32 {
        let Some(catalog) = job.catalog.as_ref() else {
            return 0;
        };
        let nested = catalog.list_own_nested_catalogs();
        let count = nested.len() as u32;

        // Pushed in reverse so siblings pop in the catalog's listing order.
        for child in nested.into_iter().rev() {
            let parent_hash = self.params.no_close.then_some(job.hash);
            ctx.catalog_stack.push(CatalogJob::new(
                child.mountpoint,
                child.hash,
                job.tree_level + 1,
                job.history_depth,
                parent_hash,
            ));
        }
        count
    }

    /// Emit the job according to the strategy. Depth-first jobs with pending
    /// descendants are parked on the callback stack instead.
    async fn yield_to_listeners(
        &mut self,
        mut job: CatalogJob<F::Catalog>,
        ctx: &mut TraversalContext<F::Catalog>,
    ) -> Result<()> {
        match ctx.strategy {
            TraversalStrategy::BreadthFirst => self.yield_job(&mut job).await,
            TraversalStrategy::DepthFirst => {
                if job.referenced_catalogs > 0 {
                    self.postpone_yield(job, ctx).await?;
                    return Ok(());
                }
                self.yield_job(&mut job).await?;
                self.handle_postponed_yields(ctx).await
            }
        }
    }

    /// Hand the job's catalog to every listener, re-opening it first if it
    /// was parked, and close it afterwards unless `no_close` keeps it.
    async fn yield_job(&mut self, job: &mut CatalogJob<F::Catalog>) -> Result<()> {
        if job.postponed && !self.params.no_close && job.catalog.is_none() {
            let reattached = self
                .fetcher
                .attach_catalog(
                    &job.hash,
                    &job.mountpoint,
                    &job.catalog_file_path,
                    !job.is_root(),
                )
                .await;
            match reattached {
                Ok(catalog) => job.catalog = Some(catalog),
                Err(e) => {
                    self.log_error(&format!("failed to re-open catalog {}", job.hash));
                    return Err(e.into());
                }
            }
        }

        let data = match job.catalog.as_ref() {
            Some(catalog) => CatalogData {
                catalog,
                hash: job.hash,
                tree_level: job.tree_level,
                file_size: job.catalog_file_size,
                history_depth: job.history_depth,
            },
            None => {
                return Err(
                    FetchError::CatalogOpenFailed("catalog handle missing at yield".into()).into(),
                );
            }
        };

        for listener in self.listeners.iter_mut() {
            if !listener(&data) {
                return Err(TraversalError::Aborted);
            }
        }

        if self.params.no_close {
            // Ownership of the catalog and its database file moves to the
            // retention arena; the listener keeps using it by hash.
            if let Some(catalog) = job.catalog.take() {
                self.retained.insert(job.hash, catalog);
            }
            return Ok(());
        }

        self.close_catalog(job, true).await
    }

    /// Park a depth-first job until all of its pushed edges have drained.
    async fn postpone_yield(
        &mut self,
        mut job: CatalogJob<F::Catalog>,
        ctx: &mut TraversalContext<F::Catalog>,
    ) -> Result<()> {
        job.postponed = true;
        if !self.params.no_close {
            // Closed without unlinking; re-opened just before yielding.
            self.close_catalog(&mut job, false).await?;
        }
        ctx.callback_stack.push(job);
        Ok(())
    }

    /// Release postponed yields enabled by a completed (or ignored) job.
    ///
    /// Every drained job decrements the pending count of the callback
    /// stack's top; parents whose count reaches zero are yielded and drain
    /// their own parent in turn.
    async fn handle_postponed_yields(
        &mut self,
        ctx: &mut TraversalContext<F::Catalog>,
    ) -> Result<()> {
        if ctx.strategy == TraversalStrategy::BreadthFirst {
            return Ok(());
        }

        loop {
            let released = match ctx.callback_stack.top_mut() {
                Some(parent) => {
                    parent.referenced_catalogs -= 1;
                    parent.referenced_catalogs == 0
                }
                None => break,
            };
            if !released {
                break;
            }
            if let Some(mut parent) = ctx.callback_stack.pop() {
                self.yield_job(&mut parent).await?;
            }
        }
        Ok(())
    }

    /// Drop the catalog handle and optionally unlink its database file.
    async fn close_catalog(&self, job: &mut CatalogJob<F::Catalog>, unlink: bool) -> Result<()> {
        job.catalog = None;
        if unlink && !job.catalog_file_path.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::remove_file(&job.catalog_file_path).await {
                self.log_error(&format!(
                    "failed to unlink {} - {}",
                    job.catalog_file_path.display(),
                    e
                ));
                return Err(TraversalError::Unlink {
                    path: std::mem::take(&mut job.catalog_file_path),
                    source: e,
                });
            }
        }
        Ok(())
    }

    fn log_error(&self, message: &str) {
        if self.params.quiet {
            tracing::debug!("{message}");
        } else {
            tracing::error!("{message}");
        }
    }
}
