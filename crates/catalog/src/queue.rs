//! Pending traversal work units and their ordered container.

use cairn_core::Digest;
use std::path::PathBuf;

/// A catalog that still needs to be traversed, together with its mutable
/// processing state.
///
/// Jobs are created on push, mutated by the engine while the catalog is
/// fetched and its edges are expanded, and destroyed after emission or skip.
pub struct CatalogJob<C> {
    /// Mount point of the catalog; `""` for root catalogs.
    pub mountpoint: String,
    /// Content hash of the catalog.
    pub hash: Digest,
    /// Depth in the nested-catalog tree; 0 marks a root catalog.
    pub tree_level: u32,
    /// Revisions walked back from HEAD; 0 is current.
    pub history_depth: u32,
    /// Hash of the parent catalog, set when parents stay attached.
    pub parent_hash: Option<Digest>,

    /// Local path of the fetched catalog database file.
    pub catalog_file_path: PathBuf,
    /// Size of the fetched catalog database file in bytes.
    pub catalog_file_size: u64,
    /// Skip this job without emission.
    pub ignore: bool,
    /// The opened catalog, present between fetch and close.
    pub catalog: Option<C>,
    /// Number of outgoing edges pushed for this catalog; depth-first
    /// emission waits until all of them have been drained.
    pub referenced_catalogs: u32,
    /// Parked on the callback stack awaiting its descendants.
    pub postponed: bool,
}

impl<C> CatalogJob<C> {
    /// Create a fresh job for a catalog reference.
    pub fn new(
        mountpoint: impl Into<String>,
        hash: Digest,
        tree_level: u32,
        history_depth: u32,
        parent_hash: Option<Digest>,
    ) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            hash,
            tree_level,
            history_depth,
            parent_hash,
            catalog_file_path: PathBuf::new(),
            catalog_file_size: 0,
            ignore: false,
            catalog: None,
            referenced_catalogs: 0,
            postponed: false,
        }
    }

    /// Create a job for a root catalog at the given history depth.
    pub fn root(hash: Digest, history_depth: u32) -> Self {
        Self::new("", hash, 0, history_depth, None)
    }

    /// True for a root catalog.
    pub fn is_root(&self) -> bool {
        self.tree_level == 0
    }
}

/// LIFO container of pending traversal units.
///
/// Both traversal strategies pop from the top; breadth- versus depth-first
/// ordering falls out of the order in which edges are pushed.
pub struct JobStack<C> {
    jobs: Vec<CatalogJob<C>>,
}

impl<C> JobStack<C> {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn push(&mut self, job: CatalogJob<C>) {
        self.jobs.push(job);
    }

    pub fn pop(&mut self) -> Option<CatalogJob<C>> {
        self.jobs.pop()
    }

    /// The job most recently pushed, mutable.
    pub fn top_mut(&mut self) -> Option<&mut CatalogJob<C>> {
        self.jobs.last_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<C> Default for JobStack<C> {
    fn default() -> Self {
        Self::new()
    }
}
