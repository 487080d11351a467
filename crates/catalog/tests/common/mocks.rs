//! In-memory repository mock for traversal tests.

use async_trait::async_trait;
use cairn_catalog::error::{FetchError, FetchResult};
use cairn_catalog::fetcher::{
    CatalogHandle, HistoryHandle, Manifest, NestedCatalogRef, ObjectFetcher,
};
use cairn_core::digest::hash_mem;
use cairn_core::{Algorithm, Digest};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Deterministic digest for a symbolic catalog name.
pub fn digest(name: &str) -> Digest {
    hash_mem(name.as_bytes(), Algorithm::Sha1)
}

/// Declarative description of one catalog in the mock repository.
#[derive(Clone, Default)]
pub struct CatalogSpec {
    pub nested: Vec<(String, Digest)>,
    pub previous: Option<Digest>,
    pub last_modified: u64,
}

/// A catalog handle backed by a [`CatalogSpec`].
pub struct MockCatalog {
    is_root: bool,
    spec: CatalogSpec,
}

impl CatalogHandle for MockCatalog {
    fn is_root(&self) -> bool {
        self.is_root
    }

    fn previous_revision(&self) -> Digest {
        self.spec
            .previous
            .unwrap_or_else(|| Digest::null(Algorithm::Sha1))
    }

    fn list_own_nested_catalogs(&self) -> Vec<NestedCatalogRef> {
        self.spec
            .nested
            .iter()
            .map(|(mountpoint, hash)| NestedCatalogRef {
                mountpoint: mountpoint.clone(),
                hash: *hash,
            })
            .collect()
    }

    fn last_modified(&self) -> u64 {
        self.spec.last_modified
    }

    fn database_path(&self) -> PathBuf {
        // No database file behind mock catalogs; the engine skips unlinking.
        PathBuf::new()
    }

    fn drop_database_ownership(&mut self) {}
}

pub struct MockHistory {
    snapshots: Vec<Digest>,
}

impl HistoryHandle for MockHistory {
    fn snapshot_hashes(&self) -> Vec<Digest> {
        self.snapshots.clone()
    }
}

/// An in-memory repository serving catalogs from a spec map.
#[derive(Default)]
pub struct MockRepo {
    head: Option<Digest>,
    catalogs: HashMap<Digest, CatalogSpec>,
    snapshots: Option<Vec<Digest>>,
    transport_failures: HashSet<Digest>,
    fetch_counts: Mutex<HashMap<Digest, u32>>,
}

impl MockRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the repository HEAD root catalog.
    pub fn set_head(&mut self, name: &str) {
        self.head = Some(digest(name));
    }

    /// Add a catalog: nested children by name, optional previous revision,
    /// and a last-modified timestamp.
    pub fn add_catalog(
        &mut self,
        name: &str,
        nested: &[&str],
        previous: Option<&str>,
        last_modified: u64,
    ) {
        let spec = CatalogSpec {
            nested: nested
                .iter()
                .map(|child| (format!("/{child}"), digest(child)))
                .collect(),
            previous: previous.map(digest),
            last_modified,
        };
        self.catalogs.insert(digest(name), spec);
    }

    /// Publish a named-snapshot history database.
    pub fn set_snapshots(&mut self, names: &[&str]) {
        self.snapshots = Some(names.iter().map(|n| digest(n)).collect());
    }

    /// Make fetches of the named catalog fail with a transport error.
    pub fn fail_transport(&mut self, name: &str) {
        self.transport_failures.insert(digest(name));
    }

    /// Number of times the named catalog was fetched or re-attached.
    pub fn fetch_count(&self, name: &str) -> u32 {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(&digest(name))
            .copied()
            .unwrap_or(0)
    }

    fn open(&self, hash: &Digest, is_nested: bool) -> FetchResult<MockCatalog> {
        if self.transport_failures.contains(hash) {
            return Err(FetchError::Transport("connection reset".to_string()));
        }
        let spec = self.catalogs.get(hash).ok_or(FetchError::NotFound)?;
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(*hash)
            .or_insert(0) += 1;
        Ok(MockCatalog {
            is_root: !is_nested,
            spec: spec.clone(),
        })
    }
}

#[async_trait]
impl ObjectFetcher for MockRepo {
    type Catalog = MockCatalog;
    type History = MockHistory;

    async fn fetch_manifest(&self) -> FetchResult<Manifest> {
        let catalog_hash = self.head.ok_or(FetchError::NotFound)?;
        Ok(Manifest {
            catalog_hash,
            repository_name: "test.cairn.io".to_string(),
        })
    }

    async fn fetch_catalog(
        &self,
        hash: &Digest,
        _mountpoint: &str,
        _parent: Option<&Self::Catalog>,
        is_nested: bool,
    ) -> FetchResult<Self::Catalog> {
        self.open(hash, is_nested)
    }

    async fn attach_catalog(
        &self,
        hash: &Digest,
        _mountpoint: &str,
        _database_path: &Path,
        is_nested: bool,
    ) -> FetchResult<Self::Catalog> {
        self.open(hash, is_nested)
    }

    async fn fetch_history(&self) -> FetchResult<Self::History> {
        match &self.snapshots {
            Some(snapshots) => Ok(MockHistory {
                snapshots: snapshots.clone(),
            }),
            None => Err(FetchError::NotFound),
        }
    }
}
