//! Catalog DAG traversal for the Cairn filesystem client.
//!
//! A repository's namespace is described by a tree of signed catalogs; each
//! root catalog additionally links to the root of the previous revision.
//! This crate walks that DAG:
//! - [`fetcher`] defines the interfaces to the external object fetcher.
//! - [`queue`] holds pending traversal units and their ordering.
//! - [`traversal`] implements the engine with its pruning and emission rules.

pub mod error;
pub mod fetcher;
pub mod queue;
pub mod traversal;

pub use error::{FetchError, FetchResult, TraversalError};
pub use fetcher::{CatalogHandle, HistoryHandle, Manifest, NestedCatalogRef, ObjectFetcher};
pub use queue::{CatalogJob, JobStack};
pub use traversal::{
    CatalogData, CatalogTraversal, TimestampSource, TraversalParams, TraversalStrategy,
};
