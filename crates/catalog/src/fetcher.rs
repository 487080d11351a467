//! Interfaces to the external repository fetcher.
//!
//! The traversal engine never talks to the network itself: it consumes an
//! [`ObjectFetcher`] that downloads, verifies, and opens catalog blobs, and it
//! works with the opened catalogs through the [`CatalogHandle`] trait.

use crate::error::FetchResult;
use async_trait::async_trait;
use cairn_core::Digest;
use std::path::{Path, PathBuf};

/// The repository manifest: entry point into the current catalog DAG.
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Content hash of the HEAD root catalog.
    pub catalog_hash: Digest,
    /// Fully qualified repository name.
    pub repository_name: String,
}

/// A nested-catalog reference listed by a parent catalog.
#[derive(Clone, Debug)]
pub struct NestedCatalogRef {
    /// Mount point of the nested catalog below the parent.
    pub mountpoint: String,
    /// Content hash of the nested catalog.
    pub hash: Digest,
}

/// An opened catalog database.
///
/// Handles are scoped to a traversal job and destroyed on close, unless the
/// traversal runs with `no_close` and transfers them to the listener.
pub trait CatalogHandle: Send {
    /// True for a root catalog (mount point `""`).
    fn is_root(&self) -> bool;

    /// Digest of the preceding revision's root catalog. The null digest
    /// terminates the revision chain.
    fn previous_revision(&self) -> Digest;

    /// Nested catalogs mounted directly below this catalog.
    fn list_own_nested_catalogs(&self) -> Vec<NestedCatalogRef>;

    /// Last-modified timestamp recorded in the catalog, seconds since epoch.
    fn last_modified(&self) -> u64;

    /// Path of the catalog database file on local disk.
    fn database_path(&self) -> PathBuf;

    /// Stop the handle from deleting its database file on drop; the caller
    /// manages the file from now on.
    fn drop_database_ownership(&mut self);
}

/// A history database enumerating named snapshots.
pub trait HistoryHandle: Send {
    /// Root catalog hashes of all named snapshots.
    fn snapshot_hashes(&self) -> Vec<Digest>;
}

/// Strategy interface for retrieving repository objects.
///
/// Implementations download catalog blobs, verify their signatures, and
/// decompress them into local database files. Retries are the fetcher's
/// responsibility; the traversal engine treats every failure as final.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    type Catalog: CatalogHandle + Send + Sync;
    type History: HistoryHandle;

    /// Fetch and verify the repository manifest.
    async fn fetch_manifest(&self) -> FetchResult<Manifest>;

    /// Fetch a catalog blob and open it. `parent` is the already-open parent
    /// catalog when the caller keeps catalogs attached.
    async fn fetch_catalog(
        &self,
        hash: &Digest,
        mountpoint: &str,
        parent: Option<&Self::Catalog>,
        is_nested: bool,
    ) -> FetchResult<Self::Catalog>;

    /// Re-open a previously fetched catalog from its local database file,
    /// without touching the network.
    async fn attach_catalog(
        &self,
        hash: &Digest,
        mountpoint: &str,
        database_path: &Path,
        is_nested: bool,
    ) -> FetchResult<Self::Catalog>;

    /// Fetch the named-snapshot history database.
    async fn fetch_history(&self) -> FetchResult<Self::History>;
}
