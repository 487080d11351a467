//! Core domain types for the Cairn filesystem client.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests with algorithm tags and role suffixes
//! - Cache and quota configuration
//! - Shared error types

pub mod config;
pub mod digest;
pub mod error;

pub use config::{CacheConfig, QuotaConfig};
pub use digest::{Algorithm, Digest, MAX_DIGEST_BYTES};
pub use error::{Error, Result};
